//! Prompt text captured for audit on the message row. None of this is
//! passed back into the adapter's own prompt construction; it is recorded
//! on the message row so a client that only reads persisted state can see
//! what was asked.

use serde_json::{Map, Value, json};

use crate::adapter::{ActionInput, ActionKind};
use crate::domain::{Game, StatusField};

pub const THEME_SYSTEM_PROMPT: &str =
    "Generate a JSON theme object with a short palette description and an emoji map keyed by status field name.";

pub const NARRATION_PROMPT: &str =
    "Narrate the plot outline into 3-6 sentences of prose in the target language, with no markdown, ending the scene open.";

pub const GAME_START_INSTRUCTIONS: &str =
    "Begin the adventure: introduce the scenario and prompt the player for their first action.";

pub fn default_theme() -> Value {
    json!({ "palette": "default", "emoji": {} })
}

/// The system prompt template: scenario, status-field schema, example
/// input/output, narration instructions for the target language.
pub fn build_system_prompt(game: &Game, language: &str) -> String {
    let field_names: Vec<&str> = game.status_fields.iter().map(|f| f.name.as_str()).collect();
    format!(
        "You are the game master for \"{name}\".\n\
         Scenario: {scenario}\n\
         Status fields (respond with exactly these keys): {fields:?}\n\
         Example input: {{\"type\": \"player\", \"body\": \"I open the door.\"}}\n\
         Example output: {{\"message\": \"...\", \"status\": {{...}}, \"imagePrompt\": \"...\"}}\n\
         Narrate subsequent turns in language: {language}.",
        name = game.name,
        scenario = game.scenario,
        fields = field_names,
        language = language,
    )
}

/// The JSON schema enforced on `ExecuteAction` output, rendered as audit
/// text. Status-field keys are fixed for the session's lifetime.
pub fn build_response_schema(status_fields: &[StatusField]) -> String {
    let status_properties: Map<String, Value> = status_fields
        .iter()
        .map(|f| (f.name.clone(), json!({ "type": "string", "maxLength": 30 })))
        .collect();
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "message": { "type": "string", "maxLength": 400 },
            "status": { "type": "object", "properties": status_properties, "additionalProperties": false },
            "imagePrompt": { "type": "string", "maxLength": 250 },
        },
    })
    .to_string()
}

/// The AI-JSON form of the action, recorded verbatim as `promptStatusUpdate`.
pub fn action_as_json(action: &ActionInput) -> String {
    let kind = match action.kind {
        ActionKind::Player => "player",
        ActionKind::System => "system",
    };
    json!({ "type": kind, "body": action.body }).to_string()
}
