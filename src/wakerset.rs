use std::{collections::HashMap, num::NonZeroUsize, task::Waker};

#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// The set of tasks waiting on one shared batch. Only a single task needs to
/// drive the window and the batch function; the rest just need to hear about
/// the result.
///
/// The "driving waker" is whichever waker most recently polled the shared
/// state. If its future is dropped, another registered waker is promoted and
/// woken, so the batch always has a path forward as long as any of its
/// futures are alive.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Ever increasing; a batch lives for a few milliseconds.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            driving_waker: None,
            next_token: NonZeroUsize::MIN,
        }
    }
}

impl WakerSet {
    /// Record `waker` as the driving waker for the batch. `slot` is the
    /// future's own token: empty on its first registration, reused (and the
    /// stored waker refreshed) afterwards.
    pub(crate) fn register(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        let token = self.store(slot, waker);
        self.driving_waker = Some(token);
    }

    /// Record `waker` without touching the driving waker. Passengers only
    /// need to hear about the result, or about the driver going away.
    pub(crate) fn register_passenger(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        self.store(slot, waker);
    }

    /// Whether the future holding `slot` should drive the batch: either it
    /// already does, or nobody does.
    pub(crate) fn is_driving(&self, slot: &Option<Token>) -> bool {
        match self.driving_waker {
            None => true,
            Some(ref driver) => slot.as_ref() == Some(driver),
        }
    }

    fn store(&mut self, slot: &mut Option<Token>, waker: &Waker) -> Token {
        match slot {
            Some(token) => {
                match self.wakers.get_mut(token) {
                    Some(existing) => {
                        if !existing.will_wake(waker) {
                            existing.clone_from(waker);
                        }
                    }
                    None => {
                        self.wakers.insert(token.duplicate(), waker.clone());
                    }
                }
                token.duplicate()
            }
            None => {
                let token = Token(self.next_token);
                self.next_token = self.next_token.saturating_add(1);

                self.wakers.insert(token.duplicate(), waker.clone());
                *slot = Some(token.duplicate());
                token
            }
        }
    }

    /// Remove a waker whose future lost interest. If it was driving (or
    /// nothing was), some other waker takes over and is woken so that it can
    /// poll the shared state.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker.as_ref() == Some(&token) || self.driving_waker.is_none() {
            self.driving_waker = None;
            self.wake_driver();
        }
    }

    /// Wake the driving waker, promoting an arbitrary waker to that role if
    /// there isn't one. Used when the batch became ready to dispatch from
    /// somewhere other than a poll (e.g. the key limit was reached).
    pub(crate) fn wake_driver(&mut self) {
        if self.driving_waker.is_none() {
            self.driving_waker = self.wakers.keys().next().map(Token::duplicate);
        }

        if let Some(waker) = self.driving_waker.as_ref().and_then(|t| self.wakers.get(t)) {
            waker.wake_by_ref();
        }
    }

    /// Wake everybody except `skip`, which is presumably the caller that is
    /// about to collect its own result.
    pub(crate) fn wake_all_except(self, skip: Option<Token>) {
        self.wakers
            .into_iter()
            .filter(|(token, _waker)| Some(token) != skip.as_ref())
            .for_each(|(_token, waker)| waker.wake());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }
}
