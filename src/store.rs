//! The slice of shared application state the acknowledgement tracker reads
//! and writes.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    /// Last acknowledged (read) message id, per conversation
    pub ack: HashMap<String, String>,

    /// Latest known message id, per conversation
    pub last_message_map: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatAction {
    SetConverseAck {
        converse_id: String,
        last_message_id: String,
    },

    /// A new message arrived in a conversation. Ignored if it's older than
    /// the one already recorded.
    SetLastMessage {
        converse_id: String,
        last_message_id: String,
    },

    /// Bulk load of acknowledgement pointers, e.g. right after login.
    /// Entries older than the pointer already held are ignored.
    SetAckInfo(Vec<(String, String)>),
}

impl ChatState {
    pub fn reduce(&mut self, action: ChatAction) {
        match action {
            ChatAction::SetConverseAck {
                converse_id,
                last_message_id,
            } => {
                self.ack.insert(converse_id, last_message_id);
            }
            ChatAction::SetLastMessage {
                converse_id,
                last_message_id,
            } => advance(&mut self.last_message_map, converse_id, last_message_id),
            ChatAction::SetAckInfo(entries) => {
                for (converse_id, last_message_id) in entries {
                    advance(&mut self.ack, converse_id, last_message_id);
                }
            }
        }
    }

    pub fn converse_ack(&self, converse_id: &str) -> Option<&str> {
        self.ack.get(converse_id).map(String::as_str)
    }

    pub fn converse_last_message(&self, converse_id: &str) -> Option<&str> {
        self.last_message_map.get(converse_id).map(String::as_str)
    }
}

// Message ids sort by creation time, so a pointer only ever moves to a
// greater id.
fn advance(map: &mut HashMap<String, String>, converse_id: String, message_id: String) {
    let current = map.entry(converse_id).or_default();
    if *current < message_id {
        *current = message_id;
    }
}

/// A synchronous state store: selectors read, actions write.
pub trait StateStore {
    fn read<R>(&self, selector: impl FnOnce(&ChatState) -> R) -> R;

    fn dispatch(&self, action: ChatAction);
}

impl<S: StateStore + ?Sized> StateStore for &S {
    fn read<R>(&self, selector: impl FnOnce(&ChatState) -> R) -> R {
        (**self).read(selector)
    }

    fn dispatch(&self, action: ChatAction) {
        (**self).dispatch(action)
    }
}

impl<S: StateStore + ?Sized> StateStore for std::sync::Arc<S> {
    fn read<R>(&self, selector: impl FnOnce(&ChatState) -> R) -> R {
        (**self).read(selector)
    }

    fn dispatch(&self, action: ChatAction) {
        (**self).dispatch(action)
    }
}

#[derive(Debug, Default)]
pub struct ChatStore {
    state: RwLock<ChatState>,
}

impl ChatStore {
    pub fn new(state: ChatState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }
}

impl StateStore for ChatStore {
    fn read<R>(&self, selector: impl FnOnce(&ChatState) -> R) -> R {
        selector(&self.state.read())
    }

    fn dispatch(&self, action: ChatAction) {
        self.state.write().reduce(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_message_only_moves_forward() {
        let store = ChatStore::default();
        let set = |id: &str| ChatAction::SetLastMessage {
            converse_id: "c1".to_owned(),
            last_message_id: id.to_owned(),
        };

        store.dispatch(set("m2"));
        store.dispatch(set("m1"));
        assert_eq!(
            store.read(|s| s.converse_last_message("c1").map(str::to_owned)),
            Some("m2".to_owned())
        );
    }

    #[test]
    fn ack_info_bulk_load() {
        let store = ChatStore::default();
        store.dispatch(ChatAction::SetAckInfo(vec![
            ("c1".to_owned(), "m1".to_owned()),
            ("c2".to_owned(), "m9".to_owned()),
        ]));

        assert_eq!(store.read(|s| s.ack.len()), 2);
        assert_eq!(
            store.read(|s| s.converse_ack("c2").map(str::to_owned)),
            Some("m9".to_owned())
        );
    }

    #[test]
    fn ack_info_never_moves_a_pointer_back() {
        let store = ChatStore::default();
        store.dispatch(ChatAction::SetConverseAck {
            converse_id: "c1".to_owned(),
            last_message_id: "m7".to_owned(),
        });

        store.dispatch(ChatAction::SetAckInfo(vec![
            ("c1".to_owned(), "m3".to_owned()),
            ("c2".to_owned(), "m2".to_owned()),
        ]));

        let ack = |id: &str| store.read(|s| s.converse_ack(id).map(str::to_owned));
        assert_eq!(ack("c1"), Some("m7".to_owned()));
        assert_eq!(ack("c2"), Some("m2".to_owned()));
    }
}
