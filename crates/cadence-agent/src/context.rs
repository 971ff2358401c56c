use crate::ports::ChatMessage;
use cadence_types::{CompletionStatus, MemorySearchResult, Message, Role};

/// System prompt with retrieved memories appended as a numbered list.
pub fn system_prompt(base: &str, memories: &[MemorySearchResult]) -> String {
    if memories.is_empty() {
        return base.to_string();
    }
    let mut prompt = String::with_capacity(base.len() + 64 * memories.len());
    prompt.push_str(base);
    prompt.push_str("\n\nHere are some relevant memories from previous conversations:\n");
    for (i, memory) in memories.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, memory.content.trim()));
    }
    prompt
}

/// Builds the model context for answering `user`.
///
/// `history` is persisted conversation history, oldest first. System
/// messages, unfinished or failed messages and the user message itself are
/// skipped.
pub fn build_context(
    base_prompt: &str,
    memories: &[MemorySearchResult],
    history: &[Message],
    user: &Message,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_prompt(base_prompt, memories)));

    for message in history {
        if message.id == user.id
            || message.completion_status != CompletionStatus::Completed
            || message.contents.trim().is_empty()
        {
            continue;
        }
        match message.role {
            Role::User => messages.push(ChatMessage::user(&message.contents)),
            Role::Assistant => messages.push(ChatMessage::assistant(&message.contents)),
            Role::System => {}
        }
    }

    messages.push(ChatMessage::user(&user.contents));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ChatRole;

    fn completed(id: &str, role: Role, seq: i64, text: &str) -> Message {
        let mut m = Message::new(id, "conv_1", role, seq, text);
        m.completion_status = CompletionStatus::Completed;
        m
    }

    #[test]
    fn memories_are_numbered_in_prompt() {
        let memories = vec![
            MemorySearchResult {
                memory_id: "mem_1".into(),
                score: 0.9,
                content: "Likes tea".into(),
            },
            MemorySearchResult {
                memory_id: "mem_2".into(),
                score: 0.8,
                content: "Lives in Oslo ".into(),
            },
        ];
        let prompt = system_prompt("Be brief.", &memories);
        assert!(prompt.starts_with("Be brief.\n\n"));
        assert!(prompt.contains("1. Likes tea\n2. Lives in Oslo\n"));
        assert_eq!(system_prompt("Be brief.", &[]), "Be brief.");
    }

    #[test]
    fn history_skips_system_failed_and_current() {
        let user = completed("msg_4", Role::User, 4, "And now?");
        let mut failed = completed("msg_3", Role::Assistant, 3, "partial");
        failed.completion_status = CompletionStatus::Failed;
        let history = vec![
            completed("msg_0", Role::System, 0, "internal"),
            completed("msg_1", Role::User, 1, "Hi"),
            completed("msg_2", Role::Assistant, 2, "Hello!"),
            failed,
            user.clone(),
        ];

        let context = build_context("Prompt", &[], &history, &user);
        let roles: Vec<ChatRole> = context.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User]
        );
        assert_eq!(context[1].content, "Hi");
        assert_eq!(context.last().unwrap().content, "And now?");
    }
}
