//! Rendering gadget outcomes into conversation messages.
//!
//! The assistant's raw response (markers embedded) is appended once per
//! iteration; each gadget outcome then becomes one user message so the
//! model sees results, errors and skip notices next turn. Adapters needing
//! strict role alternation merge the consecutive user messages.

use crate::gadget::GadgetExecutionResult;

/// Renders one gadget outcome as a user-visible result block.
pub(crate) fn render_result(result: &GadgetExecutionResult) -> String {
    let head = format!("Gadget {} [{}]", result.name, result.invocation_id);
    if let Some(dependency) = &result.skipped_due_to_failed_dependency {
        return format!(
            "{head} was skipped: dependency '{dependency}' did not complete successfully."
        );
    }
    if let Some(error) = &result.error {
        return format!("{head} failed: {error}");
    }
    match &result.result {
        Some(text) if !text.is_empty() => format!("{head} returned:\n{text}"),
        Some(_) => format!("{head} returned no output."),
        None => format!("{head} was skipped."),
    }
}
