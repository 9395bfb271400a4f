//! Data structures for passing keys into a batch function and values back out
//! of it.

use std::borrow::Borrow;
use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;
use std::mem;
use std::num::NonZeroUsize;

#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    /// Tokens are deliberately not `Clone`; the controller's in-flight index
    /// is the only other place allowed to hold one.
    pub(crate) fn duplicate(&self) -> Self {
        Token(self.0)
    }
}

/// Trait for response entries that carry their own key, such as a user
/// record that contains its user id. Used by [`KeySet::values_from_iter`] to
/// match a flat response list back up with the requested keys.
pub trait KeyedEntry<Key: ?Sized> {
    fn get_key(&self) -> &Key;
}

/// What to do when a response list contains more than one entry for the same
/// key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    /// Keep the first entry seen for a key
    Ignore,
    /// Keep the last entry seen for a key
    Replace,
}

/// A set of keys passed into a batch function. Use the `keys` method to get
/// the set of keys, all of which will be unique, so that you can execute your
/// request. Then, use one of the `into_values` family of methods to turn your
/// response into a [`ValueSet`], which is handed back to the controller.
///
/// A key that the backend doesn't know about isn't an error: every builder
/// method leaves such keys empty, and their futures resolve to `Ok(None)`.
#[derive(Debug)]
pub struct KeySet<Key: Eq + Hash> {
    // Each key is associated with a Token, which is shared by every future
    // waiting on that key, and each live token carries the number of waiters
    // *past the first*; that is, the number of times the resulting value will
    // need to be cloned.
    //
    // Tokens are created from the len of `keys`, so keys are never removed
    // from that table. A key whose waiters have all gone away is removed from
    // `tokens` instead, which hides it from `keys()` and from the batch.
    keys: HashMap<Key, Token>,
    tokens: HashMap<Token, usize>,
}

impl<Key: Eq + Hash> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: HashMap::new(),
            tokens: HashMap::new(),
        }
    }

    /// Add a waiter for a key, and return the token associated with that
    /// key. Adding a key that's already present just bumps its waiter count.
    pub(crate) fn add_key(&mut self, key: Key) -> Token {
        let new_token = Token(NonZeroUsize::MIN.saturating_add(self.keys.len()));
        let token = self.keys.entry(key).or_insert(new_token).duplicate();
        self.tokens
            .entry(token.duplicate())
            .and_modify(|count| *count += 1)
            .or_insert(0);

        token
    }

    /// Withdraw one waiter's interest in a key. Once a key has no waiters
    /// left it won't be sent to the batch function.
    pub(crate) fn discard_token(&mut self, token: &Token) {
        match self.tokens.entry(token.duplicate()) {
            Entry::Occupied(entry) if *entry.get() == 0 => {
                entry.remove();
            }
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
            }
            Entry::Vacant(_) => {}
        }
    }

    /// Whether anybody is still waiting on the key behind `token`.
    pub(crate) fn has_waiters(&self, token: &Token) -> bool {
        self.tokens.contains_key(token)
    }

    /// Take the keyset out of this particular &mut self instance, replacing it
    /// with an empty set. Used when a batch leaves the accumulating state.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            keys: mem::take(&mut self.keys),
            tokens: mem::take(&mut self.tokens),
        }
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Get an iterator over all the keys in this keyset. These are guaranteed
    /// to be:
    ///
    /// - Unique
    /// - Between 1 and the configured max_keys of the related BatchRules
    /// - In an arbitrary order
    pub fn keys(&self) -> impl Iterator<Item = &Key> + Clone {
        let tokens = &self.tokens;

        self.keys
            .iter()
            .filter(move |(_key, token)| tokens.contains_key(token))
            .map(|(key, _token)| key)
    }

    /// Every live key paired with its token. The controller uses this to
    /// remember which keys a running batch is responsible for.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&Key, &Token)> {
        let tokens = &self.tokens;

        self.keys
            .iter()
            .filter(move |(_key, token)| tokens.contains_key(token))
    }

    /// Pair every key with a value. Use this when your batch operation is
    /// guaranteed to produce something for each key.
    pub fn into_values<Value>(self, mut get_value: impl FnMut(&Key) -> Value) -> ValueSet<Value> {
        self.lookup_values(move |key| Some(get_value(key)))
    }

    /// Pair every key with a value, if there is one. Keys for which
    /// `get_value` returns `None` resolve to `Ok(None)` for their waiters.
    pub fn lookup_values<Value>(
        self,
        mut get_value: impl FnMut(&Key) -> Option<Value>,
    ) -> ValueSet<Value> {
        let KeySet { keys, tokens } = self;

        let values = keys
            .into_iter()
            .filter_map(|(key, token)| {
                let count = *tokens.get(&token)?;
                let value = get_value(&key);
                Some((token, ValueSetEntry { value, count }))
            })
            .collect();

        ValueSet { values }
    }

    /// Fallible version of into_values. Same as into_values, but will return
    /// an error the first time `get_value` returns an error.
    pub fn try_into_values<Value, Error>(
        self,
        mut get_value: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> Result<ValueSet<Value>, Error> {
        let KeySet { keys, tokens } = self;

        keys.into_iter()
            .filter_map(|(key, token)| {
                let count = *tokens.get(&token)?;
                Some((key, token, count))
            })
            .map(|(key, token, count)| {
                let value = get_value(&key)?;
                Ok((
                    token,
                    ValueSetEntry {
                        value: Some(value),
                        count,
                    },
                ))
            })
            .collect::<Result<_, Error>>()
            .map(|values| ValueSet { values })
    }

    /// Build the value set from a map of results. Entries in the map for keys
    /// that weren't requested are dropped.
    pub fn values_from_map<Value>(self, mut found: HashMap<Key, Value>) -> ValueSet<Value> {
        self.lookup_values(move |key| found.remove(key))
    }

    /// Build the value set from a flat list of response entries, each of
    /// which knows its own key. This is the usual shape of a "get many by id"
    /// endpoint. Unrequested entries are ignored, and requested keys with no
    /// entry resolve to `Ok(None)`.
    pub fn values_from_iter<Q, Value>(
        self,
        on_duplicate: OnDuplicate,
        entries: impl IntoIterator<Item = Value>,
    ) -> ValueSet<Value>
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        Value: KeyedEntry<Q>,
    {
        let mut found: HashMap<Token, Value> = HashMap::with_capacity(self.tokens.len());

        for entry in entries {
            let token = match self.keys.get(entry.get_key()) {
                Some(token) if self.tokens.contains_key(token) => token.duplicate(),
                _ => continue,
            };

            match (found.entry(token), on_duplicate) {
                (Entry::Vacant(slot), _) => {
                    slot.insert(entry);
                }
                (Entry::Occupied(mut slot), OnDuplicate::Replace) => {
                    slot.insert(entry);
                }
                (Entry::Occupied(_), OnDuplicate::Ignore) => {}
            }
        }

        let KeySet { tokens, .. } = self;

        let values = tokens
            .into_iter()
            .map(|(token, count)| {
                let value = found.remove(&token);
                (token, ValueSetEntry { value, count })
            })
            .collect();

        ValueSet { values }
    }
}

#[derive(Debug)]
struct ValueSetEntry<Value> {
    count: usize,
    value: Option<Value>,
}

/// A value set is an opaque data structure that contains the result of a batch
/// operation. It is created with one of the [`KeySet`] builder methods, and is
/// used by the controller to distribute the values to the correct waiting
/// futures.
#[derive(Debug)]
pub struct ValueSet<Value> {
    values: HashMap<Token, ValueSetEntry<Value>>,
}

impl<Value> ValueSet<Value> {
    /// Number of distinct keys still held by this set
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Register another waiter for a key that was already part of the batch.
    /// Returns false (and does nothing) if the token isn't present.
    pub(crate) fn add_waiter(&mut self, token: &Token) -> bool {
        match self.values.get_mut(token) {
            Some(entry) => {
                entry.count += 1;
                true
            }
            None => false,
        }
    }

    /// Look at the value for a token without consuming it.
    pub(crate) fn peek(&self, token: &Token) -> Option<&Value> {
        self.values.get(token)?.value.as_ref()
    }

    /// Discard a token associated with this ValueSet without getting the
    /// value. No-op if the token isn't present.
    pub(crate) fn discard(&mut self, token: &Token) {
        match self.values.entry(token.duplicate()) {
            Entry::Vacant(..) => {}
            Entry::Occupied(entry) if entry.get().count == 0 => {
                entry.remove();
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().count -= 1;
            }
        }
    }
}

impl<Value: Clone> ValueSet<Value> {
    /// Take a value associated with a token out of this ValueSet. If the
    /// count of this token is > 0, the value is cloned. The outer `Option` is
    /// `None` only if the token was never part of this set; the inner one is
    /// `None` when the batch function had nothing for the key.
    pub(crate) fn take(&mut self, token: &Token) -> Option<Option<Value>> {
        match self.values.entry(token.duplicate()) {
            Entry::Vacant(..) => None,
            Entry::Occupied(entry) if entry.get().count == 0 => Some(entry.remove().value),
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                entry.count -= 1;
                Some(entry.value.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Profile {
        id: String,
        name: &'static str,
    }

    impl KeyedEntry<str> for Profile {
        fn get_key(&self) -> &str {
            &self.id
        }
    }

    fn profile(id: &str, name: &'static str) -> Profile {
        Profile {
            id: id.to_owned(),
            name,
        }
    }

    #[test]
    fn duplicate_keys_share_a_token() {
        let mut keys = KeySet::new();
        let t1 = keys.add_key("u1".to_owned());
        let t2 = keys.add_key("u1".to_owned());
        let t3 = keys.add_key("u2".to_owned());

        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn discarded_keys_are_hidden() {
        let mut keys = KeySet::new();
        let t1 = keys.add_key(1);
        let _t2 = keys.add_key(2);

        keys.discard_token(&t1);
        let remaining: Vec<&i32> = keys.keys().collect();
        assert_eq!(remaining, [&2]);
    }

    #[test]
    fn values_from_iter_tolerates_missing_and_unknown() {
        let mut keys = KeySet::new();
        let t1 = keys.add_key("u1".to_owned());
        let t2 = keys.add_key("u2".to_owned());

        let mut values = keys.values_from_iter(
            OnDuplicate::Ignore,
            vec![profile("u1", "alice"), profile("u9", "mallory")],
        );

        assert_eq!(values.len(), 2);
        assert_eq!(values.take(&t1), Some(Some(profile("u1", "alice"))));
        assert_eq!(values.take(&t2), Some(None));
    }

    #[test]
    fn values_from_iter_duplicate_policy() {
        let entries = || vec![profile("u1", "first"), profile("u1", "second")];

        let mut keys = KeySet::new();
        let token = keys.add_key("u1".to_owned());
        let mut values = keys.values_from_iter(OnDuplicate::Ignore, entries());
        assert_eq!(values.take(&token).flatten().map(|p| p.name), Some("first"));

        let mut keys = KeySet::new();
        let token = keys.add_key("u1".to_owned());
        let mut values = keys.values_from_iter(OnDuplicate::Replace, entries());
        assert_eq!(values.take(&token).flatten().map(|p| p.name), Some("second"));
    }

    #[test]
    fn late_waiters_get_clones() {
        let mut keys = KeySet::new();
        let token = keys.add_key(7);
        let mut values = keys.into_values(|key| key * 2);

        values.add_waiter(&token);
        assert_eq!(values.take(&token), Some(Some(14)));
        assert_eq!(values.take(&token), Some(Some(14)));
        assert_eq!(values.take(&token), None);
    }
}
