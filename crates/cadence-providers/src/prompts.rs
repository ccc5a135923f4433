//! Prompt templates and context rendering.
//!
//! Templates use `{name}` placeholders filled by [`render`]. Literal braces in
//! the JSON examples are never placeholders because every name is matched in
//! full.

use cadence_core::types::{ContextBundle, MessageDirection};
use chrono::{DateTime, FixedOffset, Offset, Utc};

pub const DEFAULT_PERSONA: &str = "You are a warm, attentive companion who keeps in touch with \
     the user over chat. You write short, natural messages in the user's language.";

pub const DAILY_PLANNING: &str = "Today is {date}.

Plan your own day, covering every part of it from morning to night. Describe each task \
concretely, including roughly how long it takes.

Context:
{context}

Each task has:
1. title
2. description
3. category: daily (routine), special (one-off) or reminder
4. time in HH:MM (local)

Reply with JSON only: {\"tasks\": [{\"title\": \"...\", \"description\": \"...\", \"category\": \"daily\", \"time\": \"09:00\"}]}";

pub const AUTONOMOUS_OUTREACH: &str = "Today is {date}.

Write the messages you will send to the user on your own initiative today: natural, warm \
greetings or check-ins. Spread them over the day in free moments between today's planned \
tasks. Do not repeat anything already queued.

Context:
{context}

Each message has:
1. content
2. time in HH:MM (local)

Reply with JSON only: {\"messages\": [{\"content\": \"...\", \"time\": \"09:00\"}]}";

pub const MESSAGE_MERGE: &str = "Current time: {now}

Several pending messages must go out as one. Fuse them into a single natural message with \
one consistent tone, as if said in one breath. Keep the core information and feeling of each, \
reorder or trim freely, keep it short, and make sure nothing contradicts the current time or \
today's plan.

Pending messages:
{messages}

Context:
{context}

Reply with the merged message text only, no JSON.";

pub const REPLY_DECISION: &str = "Current time: {now}

Decide what to reply to the message below and when. Keep the reply concise, do not ask \
questions back, and do not repeat anything already said in the conversation. Only bring up \
context that is relevant to this message.

- Sender: {sender}
- Message: {message}
- Context:
{context}

Provide:
1. content: the reply, in character and natural for the conversation
2. delay_minutes: 0 to reply now, otherwise minutes to wait based on what you are doing at \
this time of day (if you wait, say why in the reply)

Reply with JSON only: {\"content\": \"...\", \"delay_minutes\": 0}";

pub const MEMORY_DETECTION: &str = "Decide whether the message below contains something worth \
remembering long term: important facts, emotional moments, special events. Ignore everyday \
small talk.

- Sender: {sender}
- Message: {message}
- Context:
{context}

If there is one, provide a short title, a detailed content, strength (1-10), weight \
(0.1-10.0, retrieval priority) and forget_days (0 = never forget).

Reply with JSON only:
- nothing to remember: {\"has_memory\": false}
- otherwise: {\"has_memory\": true, \"title\": \"...\", \"content\": \"...\", \"strength\": 5, \"weight\": 1.0, \"forget_days\": 30}";

/// Replace each `{key}` with its value.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

/// System prompt: persona plus the role of this call.
pub fn system_prompt(persona: &str, role: &str) -> String {
    let persona = if persona.trim().is_empty() {
        DEFAULT_PERSONA
    } else {
        persona.trim()
    };
    format!("{persona}\n\n{role}")
}

/// Numbered list of pending contents for the merge prompt.
pub fn numbered(contents: &[String]) -> String {
    contents
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}", i + 1, c.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plain-text rendering of a context bundle, local times throughout.
pub fn format_context(bundle: &ContextBundle) -> String {
    let offset = FixedOffset::east_opt(bundle.utc_offset_minutes * 60).unwrap_or(Utc.fix());
    let hm = |at: DateTime<Utc>| at.with_timezone(&offset).format("%H:%M").to_string();
    let stamp = |at: DateTime<Utc>| at.with_timezone(&offset).format("%m-%d %H:%M").to_string();

    let mut out = Vec::new();
    if !bundle.memories.is_empty() {
        out.push("Memories:".to_string());
        for m in &bundle.memories {
            out.push(format!("- {}: {} (weight {:.1})", m.title, m.content, m.weight));
        }
    }
    if !bundle.yesterday_tasks.is_empty() {
        out.push("Yesterday's plan:".to_string());
        for t in &bundle.yesterday_tasks {
            out.push(format!("- {} {} [{}]", hm(t.scheduled_time), t.title, t.status));
        }
    }
    if !bundle.planned_tasks.is_empty() {
        out.push("Today's plan:".to_string());
        for t in &bundle.planned_tasks {
            let line = if t.description.is_empty() {
                format!("- {} {}", hm(t.scheduled_time), t.title)
            } else {
                format!("- {} {}: {}", hm(t.scheduled_time), t.title, t.description)
            };
            out.push(line);
        }
    }
    if !bundle.recent_messages.is_empty() {
        out.push("Recent conversation (oldest first):".to_string());
        for m in bundle.recent_messages.iter().rev() {
            let who = match m.direction {
                MessageDirection::Received => m.sender.as_str(),
                MessageDirection::Sent => "me",
            };
            out.push(format!("- [{}] {who}: {}", stamp(m.timestamp), m.content));
        }
    }
    if !bundle.reply_tasks.is_empty() {
        out.push("Already queued to send:".to_string());
        for t in &bundle.reply_tasks {
            out.push(format!("- {} {}", hm(t.scheduled_time), t.content));
        }
    }
    if out.is_empty() {
        "(no context)".to_string()
    } else {
        out.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::{Memory, MemoryKind, MessageLog};
    use chrono::TimeZone;

    #[test]
    fn test_render_fills_placeholders_and_keeps_json_braces() {
        let out = render(REPLY_DECISION, &[("now", "09:00"), ("sender", "alice"), ("message", "hi"), ("context", "-")]);
        assert!(out.contains("Sender: alice"));
        assert!(out.contains("{\"content\": \"...\", \"delay_minutes\": 0}"));
        assert!(!out.contains("{sender}"));
    }

    #[test]
    fn test_system_prompt_falls_back_to_default_persona() {
        assert!(system_prompt("  ", "Plan.").starts_with(DEFAULT_PERSONA));
        assert_eq!(system_prompt("A singer.", "Plan."), "A singer.\n\nPlan.");
    }

    #[test]
    fn test_format_context_uses_local_offset() {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 1, 30, 0).unwrap();
        let bundle = ContextBundle {
            memories: vec![Memory {
                id: 1,
                recipient_id: 1,
                title: "Cat".into(),
                content: "Has a cat called Miso".into(),
                kind: MemoryKind::UserMemory,
                strength: 5,
                weight: 6.0,
                forget_time: None,
                metadata: serde_json::json!({}),
                created_at: at,
                updated_at: at,
            }],
            recent_messages: vec![MessageLog {
                id: 1,
                recipient_id: 1,
                direction: MessageDirection::Received,
                sender: "alice".into(),
                receiver: "me".into(),
                content: "morning!".into(),
                timestamp: at,
                reply_task_ids: vec![],
                raw: serde_json::json!({}),
            }],
            utc_offset_minutes: 480,
            ..Default::default()
        };
        let text = format_context(&bundle);
        assert!(text.contains("- Cat: Has a cat called Miso (weight 6.0)"));
        assert!(text.contains("- [03-02 09:30] alice: morning!"));
        assert_eq!(format_context(&ContextBundle::default()), "(no context)");
    }

    #[test]
    fn test_numbered() {
        assert_eq!(numbered(&["a ".into(), "b".into()]), "1. a\n2. b");
    }
}
