use crate::models::ChatMessage;
use crate::traits::ChatModel;
use crate::ServiceError;
use std::sync::Arc;
use tracing::info;

pub type SharedModel = Arc<dyn ChatModel + Send + Sync>;
type Termination = Box<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub speaker: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ConversationResult {
    pub transcript: Vec<AgentMessage>,
    pub terminated: bool,
}

/// An LLM-backed participant that answers from its own point of view.
pub struct ConversableAgent {
    name: String,
    system_message: String,
    model: SharedModel,
    termination: Option<Termination>,
}

impl ConversableAgent {
    pub fn new(name: impl Into<String>, system_message: impl Into<String>, model: SharedModel) -> Self {
        Self {
            name: name.into(),
            system_message: system_message.into(),
            model,
            termination: None,
        }
    }

    pub fn with_termination<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.termination = Some(Box::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_termination(&self, content: &str) -> bool {
        self.termination
            .as_ref()
            .is_some_and(|predicate| predicate(content))
    }

    /// Own messages are replayed as assistant turns, the other side's as user turns.
    fn perspective(&self, transcript: &[AgentMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        messages.push(ChatMessage::system(self.system_message.clone()));
        messages.extend(transcript.iter().map(|message| {
            if message.speaker == self.name {
                ChatMessage::assistant(message.content.clone())
            } else {
                ChatMessage::user(message.content.clone())
            }
        }));
        messages
    }

    pub async fn generate_reply(&self, transcript: &[AgentMessage]) -> Result<String, ServiceError> {
        self.model.complete(&self.perspective(transcript)).await
    }
}

/// Runs a two-party conversation opened by `initiator`. Each message is
/// checked against the termination predicate of the agent receiving it; the
/// conversation also stops after `max_turns` replies.
pub async fn initiate_chat(
    initiator: &ConversableAgent,
    recipient: &ConversableAgent,
    opening: &str,
    max_turns: usize,
) -> Result<ConversationResult, ServiceError> {
    let mut transcript = vec![AgentMessage {
        speaker: initiator.name().to_string(),
        content: opening.to_string(),
    }];
    info!(from = initiator.name(), to = recipient.name(), "conversation started");

    if recipient.is_termination(opening) {
        return Ok(ConversationResult {
            transcript,
            terminated: true,
        });
    }

    let turns = [(recipient, initiator), (initiator, recipient)];
    for turn in 0..max_turns {
        let (speaker, listener) = turns[turn % 2];
        let content = speaker.generate_reply(&transcript).await?;
        info!(speaker = speaker.name(), turn, "agent replied");

        let done = listener.is_termination(&content);
        transcript.push(AgentMessage {
            speaker: speaker.name().to_string(),
            content,
        });

        if done {
            info!(listener = listener.name(), "termination message received");
            return Ok(ConversationResult {
                transcript,
                terminated: true,
            });
        }
    }

    Ok(ConversationResult {
        transcript,
        terminated: false,
    })
}

pub const TEACHER_SYSTEM_MESSAGE: &str = "Your name is Isaac and you are a physics teacher. \
     The student will ask questions asking you to explain. You only answer physics questions.";

pub const STUDENT_SYSTEM_MESSAGE: &str = "Your name is Joe and you are a student. \
     You don't know Newton's laws of motion, and you want the teacher to help you with that. \
     You will ask the teacher questions so he can explain. \
     When you finally understand and want to end the conversation, say 'I understand. Thank you.'";

pub const STUDENT_OPENING: &str =
    "Good morning, can I please have some help with Newton's laws of motion?";

pub fn student_is_done(content: &str) -> bool {
    content.contains("I understand. Thank you") || content.contains("Goodbye")
}

pub fn physics_lesson(model: SharedModel) -> (ConversableAgent, ConversableAgent) {
    let teacher = ConversableAgent::new("maestro", TEACHER_SYSTEM_MESSAGE, model.clone());
    let student = ConversableAgent::new("student", STUDENT_SYSTEM_MESSAGE, model)
        .with_termination(student_is_done);
    (student, teacher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies with the scripted lines in order and records what it was sent.
    struct ScriptedModel {
        lines: Mutex<Vec<String>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        fn new(lines: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                lines: Mutex::new(lines.iter().rev().map(|line| line.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.lines.lock().unwrap().pop().unwrap_or_else(|| "...".to_string()))
        }
    }

    #[tokio::test]
    async fn conversation_ends_when_the_student_receives_a_goodbye() {
        let model = ScriptedModel::new(&[
            "The first law is about inertia.",
            "What about the second law?",
            "F equals m times a.",
            "I understand. Thank you.",
            "You're welcome. Goodbye!",
            "never used",
        ]);
        let (student, teacher) = physics_lesson(model.clone());

        let result = initiate_chat(&student, &teacher, STUDENT_OPENING, 10).await.unwrap();

        assert!(result.terminated);
        assert_eq!(result.transcript.len(), 6);
        assert_eq!(result.transcript[1].speaker, "maestro");
        assert_eq!(result.transcript[4].speaker, "student");
        assert_eq!(result.transcript[5].speaker, "maestro");
        assert_eq!(result.transcript[5].content, "You're welcome. Goodbye!");
    }

    #[tokio::test]
    async fn students_own_thanks_does_not_end_the_lesson() {
        let model = ScriptedModel::new(&["Inertia.", "I understand. Thank you.", "Any time."]);
        let (student, teacher) = physics_lesson(model);

        let result = initiate_chat(&student, &teacher, STUDENT_OPENING, 3).await.unwrap();

        assert!(!result.terminated);
        assert_eq!(result.transcript.len(), 4);
        assert_eq!(result.transcript[3].content, "Any time.");
    }

    #[tokio::test]
    async fn conversation_stops_at_max_turns() {
        let model = ScriptedModel::new(&[]);
        let (student, teacher) = physics_lesson(model);

        let result = initiate_chat(&student, &teacher, STUDENT_OPENING, 3).await.unwrap();

        assert!(!result.terminated);
        assert_eq!(result.transcript.len(), 4);
    }

    #[tokio::test]
    async fn each_agent_sees_its_own_lines_as_assistant() {
        let model = ScriptedModel::new(&["Inertia.", "Thanks.", "Goodbye"]);
        let (student, teacher) = physics_lesson(model.clone());

        initiate_chat(&student, &teacher, STUDENT_OPENING, 5).await.unwrap();

        let seen = model.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);

        let teacher_view = &seen[0];
        assert_eq!(teacher_view[0].content, TEACHER_SYSTEM_MESSAGE);
        assert_eq!(teacher_view[1].role, Role::User);

        let student_view = &seen[1];
        assert_eq!(student_view[0].content, STUDENT_SYSTEM_MESSAGE);
        assert_eq!(student_view[1].role, Role::Assistant);
        assert_eq!(student_view[2].role, Role::User);
        assert_eq!(student_view[2].content, "Inertia.");
    }

    #[test]
    fn termination_phrases() {
        assert!(student_is_done("Great. I understand. Thank you."));
        assert!(student_is_done("Goodbye!"));
        assert!(!student_is_done("Thank you, but why?"));
    }
}
