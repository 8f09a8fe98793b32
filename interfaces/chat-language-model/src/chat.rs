//! The conversation history a chat session accumulates.

use serde::{Deserialize, Serialize};

/// The author of a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The instructions the assistant follows for the whole session.
    System,
    /// A message typed by the user.
    User,
    /// A message generated by the model.
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: String,
}

impl Turn {
    /// Creates a new turn.
    pub fn new(role: Role, content: impl ToString) -> Self {
        Self {
            role,
            content: content.to_string(),
        }
    }

    /// Returns the author of the turn.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the text of the turn.
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// An error returned when a turn would break the user/assistant alternation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    /// A user turn was pushed while the previous user turn is still unanswered.
    #[error("the last user turn has not been answered yet")]
    AwaitingAssistant,
    /// An assistant turn was pushed without a user turn to answer.
    #[error("there is no user turn for the assistant to answer")]
    AwaitingUser,
}

/// The ordered, append-only history of a chat session.
///
/// An optional system turn comes first. After it, user and assistant turns alternate, starting with
/// a user turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    /// Creates an empty conversation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation that starts with a system prompt.
    pub fn with_system_prompt(prompt: impl ToString) -> Self {
        Self {
            turns: vec![Turn::new(Role::System, prompt)],
        }
    }

    /// The role the next turn must have.
    pub fn next_role(&self) -> Role {
        match self.turns.last().map(Turn::role) {
            Some(Role::User) => Role::Assistant,
            _ => Role::User,
        }
    }

    /// Appends a user turn.
    pub fn push_user(&mut self, content: impl ToString) -> Result<&Turn, ConversationError> {
        if self.next_role() != Role::User {
            return Err(ConversationError::AwaitingAssistant);
        }
        Ok(self.push(Turn::new(Role::User, content)))
    }

    /// Appends an assistant turn answering the last user turn.
    pub fn push_assistant(&mut self, content: impl ToString) -> Result<&Turn, ConversationError> {
        if self.next_role() != Role::Assistant {
            return Err(ConversationError::AwaitingUser);
        }
        Ok(self.push(Turn::new(Role::Assistant, content)))
    }

    fn push(&mut self, turn: Turn) -> &Turn {
        self.turns.push(turn);
        &self.turns[self.turns.len() - 1]
    }

    /// The system prompt, if the conversation has one.
    pub fn system_prompt(&self) -> Option<&str> {
        self.turns
            .first()
            .filter(|turn| turn.role() == Role::System)
            .map(Turn::content)
    }

    /// All turns in order.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// The most recent turn.
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// The number of turns.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Returns true if the conversation has no turns.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_serialize_like_chat_template_messages() {
        let turn = Turn::new(Role::Assistant, "hi");
        assert_eq!(
            serde_json::to_string(&turn).unwrap(),
            r#"{"role":"assistant","content":"hi"}"#
        );
    }

    #[test]
    fn turns_alternate_after_the_system_prompt() {
        let mut conversation = ConversationState::with_system_prompt("be kind");
        assert_eq!(conversation.system_prompt(), Some("be kind"));
        assert_eq!(conversation.next_role(), Role::User);

        conversation.push_user("hello").unwrap();
        assert_eq!(
            conversation.push_user("hello again"),
            Err(ConversationError::AwaitingAssistant)
        );

        conversation.push_assistant("hi there").unwrap();
        assert_eq!(
            conversation.push_assistant("anything else?"),
            Err(ConversationError::AwaitingUser)
        );

        let roles: Vec<_> = conversation.turns().iter().map(Turn::role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[test]
    fn assistant_turns_need_a_user_turn() {
        let mut conversation = ConversationState::new();
        assert!(conversation.is_empty());
        assert_eq!(conversation.system_prompt(), None);
        assert_eq!(
            conversation.push_assistant("hi"),
            Err(ConversationError::AwaitingUser)
        );
        conversation.push_user("hi").unwrap();
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn length_grows_by_two_per_exchange() {
        let mut conversation = ConversationState::with_system_prompt("system");
        for i in 0..5 {
            conversation.push_user(format!("question {i}")).unwrap();
            conversation.push_assistant(format!("answer {i}")).unwrap();
            assert_eq!(conversation.len(), 1 + 2 * (i + 1));
        }
        for pair in conversation.turns()[1..].chunks(2) {
            assert_eq!(pair[0].role(), Role::User);
            assert_eq!(pair[1].role(), Role::Assistant);
        }
    }
}
