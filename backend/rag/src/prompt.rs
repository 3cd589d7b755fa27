pub const SYSTEM_LABEL: &str = "System: ";
pub const CONTEXT_LABEL: &str = "Relevant knowledge: ";
pub const USER_LABEL: &str = "User: ";

const SECTION_SEPARATOR: &str = "\n\n";

/// Assemble the model prompt.
///
/// Sections always appear in this order: system instruction (skipped when
/// empty), retrieved context (only when `context` is given), user query.
pub fn build_prompt(system_prompt: &str, context: Option<&str>, user_prompt: &str) -> String {
    let mut prompt = String::new();

    if !system_prompt.is_empty() {
        prompt.push_str(SYSTEM_LABEL);
        prompt.push_str(system_prompt);
        prompt.push_str(SECTION_SEPARATOR);
    }

    if let Some(context) = context {
        prompt.push_str(CONTEXT_LABEL);
        prompt.push_str(context);
        prompt.push_str(SECTION_SEPARATOR);
    }

    prompt.push_str(USER_LABEL);
    prompt.push_str(user_prompt);
    prompt
}
