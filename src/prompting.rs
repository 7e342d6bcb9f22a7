use minijinja::{context, Environment};

const AGENT_NOTE_TEMPLATE: &str = include_str!("prompts/agent_note.j2");
const HANDOFF_NOTICE_TEMPLATE: &str = include_str!("prompts/handoff_notice.j2");

pub const HANDOFF_REQUEST_NOTE: &str = "Visitor asked to speak with a human agent.";

pub const SUMMARY_FALLBACK_TEXT: &str =
    "A human agent will review this conversation and follow up shortly.";

pub struct AgentNoteContext<'a> {
    pub conversation_id: &'a str,
    pub sender_name: &'a str,
    pub received_at: &'a str,
    pub summary: &'a str,
}

pub fn render_agent_note(ctx: &AgentNoteContext<'_>) -> String {
    let mut env = Environment::new();
    if env.add_template("agent_note", AGENT_NOTE_TEMPLATE).is_err() {
        return fallback_agent_note(ctx);
    }

    let Ok(template) = env.get_template("agent_note") else {
        return fallback_agent_note(ctx);
    };

    template
        .render(context! {
            conversation_id => ctx.conversation_id,
            sender_name => ctx.sender_name.trim(),
            received_at => ctx.received_at,
            summary => ctx.summary,
        })
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| fallback_agent_note(ctx))
}

fn fallback_agent_note(ctx: &AgentNoteContext<'_>) -> String {
    let mut note = format!(
        "--- Agent handoff context ---\nConversation: {}",
        ctx.conversation_id
    );
    if !ctx.sender_name.trim().is_empty() {
        note.push_str(&format!("\nVisitor name: {}", ctx.sender_name.trim()));
    }
    note.push_str(&format!("\nReceived: {}", ctx.received_at));
    note.push('\n');
    note.push_str(ctx.summary);
    note
}

pub fn render_handoff_notice(sender_name: &str) -> String {
    let mut env = Environment::new();
    if env
        .add_template("handoff_notice", HANDOFF_NOTICE_TEMPLATE)
        .is_err()
    {
        return fallback_handoff_notice(sender_name);
    }

    let Ok(template) = env.get_template("handoff_notice") else {
        return fallback_handoff_notice(sender_name);
    };

    template
        .render(context! { sender_name => sender_name.trim() })
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| fallback_handoff_notice(sender_name))
}

fn fallback_handoff_notice(sender_name: &str) -> String {
    let name = sender_name.trim();
    if name.is_empty() {
        "Thanks for reaching out. You are being connected with a human agent now, and someone will join this conversation shortly."
            .to_string()
    } else {
        format!(
            "Hi {name}, thanks for reaching out. You are being connected with a human agent now, and someone will join this conversation shortly."
        )
    }
}
