//! Prompt templates for every vision-service call.
//!
//! Detection, Analyst, Cleaner and Critic wording all lives here, along
//! with the per-type fallback used when the Analyst reply is unusable.
//!
//! Templates use `{placeholder}` markers filled by the builder functions
//! below; no template is sent to a model unfilled.

use crate::element::ElementType;

/// Goal used when the Analyst did not provide one.
pub const DEFAULT_CLEANING_GOAL: &str = "Isolate the object perfectly.";

/// Slide background assumed when detection did not report one.
pub const DEFAULT_BACKGROUND_COLOR: &str = "#FFFFFF";

/// System prompt for the single whole-slide detection call.
pub const DETECTION_PROMPT: &str = r##"You are a pixel-precise layout analyser for presentation slides. Decompose the slide into its constituent elements with exact bounding boxes.

COORDINATES
- Boxes are [ymin, xmin, ymax, xmax], normalised to 0-1000.
- 0,0 is the top-left corner, 1000,1000 the bottom-right.
- Snap every box to the visible edges of the element.

TEXT BOXES
- Include descenders (g, y, j, p, q) and ascenders/accents; never box only baseline to cap height.
- Group a paragraph into one box; split only distinct headings.

ELEMENT TYPES
- TEXT: readable text blocks.
- SHAPE: geometric backgrounds, cards, lines.
- ICON: small symbols, logos, arrows.
- IMAGE: photos, screenshots, illustrations.

Return JSON only:
{
  "backgroundColor": "#RRGGBB",
  "elements": [
    {"type": "TEXT" | "SHAPE" | "ICON" | "IMAGE", "description": "visual description", "box_2d": [ymin, xmin, ymax, xmax], "z_order": 0}
  ]
}"##;

/// System prompt for transcribing one TEXT element.
pub const TEXT_EXTRACTION_PROMPT: &str = r##"Analyse the provided text crop.
1. Transcribe the text exactly, keeping line breaks.
2. Count the visual lines.
3. Identify the dominant colour and whether the text is bold.

Return JSON only:
{
  "text": "the transcription",
  "hexColor": "#RRGGBB",
  "isBold": boolean,
  "lineCount": number
}"##;

/// User turn accompanying the detection image.
pub const DETECTION_INSTRUCTION: &str = "Analyse the slide layout for an exhaustive decomposition.";

const ANALYST_TEMPLATE: &str = r#"You plan surgical ERASE instructions that isolate one visual element of a slide as a clean asset.

TARGET TYPE: {type}
TARGET SUBJECT: {description}
SLIDE BACKGROUND: {bgColor}

CONSERVATION RULES
1. IMAGE (photo/illustration): preserve internal detail. Remove only overlays on top of it (text labels, buttons, watermarks).
2. SHAPE / ICON: strip all internal content. Wipe text and nested icons, leaving a clean solid or gradient container.

ISOLATION RULES
- Remove background clutter and neighbouring elements outside the target.
- The result must sit on a solid #FFFFFF white background.

Set "isWhiteInterior" to true when the target itself contains white areas that must survive background removal (for example a white card or a white icon face).

Return JSON only:
{
  "isWhiteInterior": boolean,
  "cleaningGoal": "one sentence describing the isolated result the critic should expect",
  "prompt": "numbered erase instructions for the image editor"
}"#;

const CRITIC_TEMPLATE: &str = r#"You are a strict quality validator for isolated slide assets.
GOAL: {cleaningGoal}

Compare the "Original Reference Crop" with the "Cleaned Candidate Result".

CHECKLIST
1. FIDELITY: does the candidate match the original subject (shape, colour, gradient) minus the overlays?
2. CLUTTER: is it completely free of text, letter fragments and overlapping sub-icons? Any remnant is a failure.
3. ISOLATION: is the background pure #FFFFFF with no fragments of the surrounding slide?
4. INTEGRITY: was any part of the subject itself erased?

SCORING (0-100)
- 95-100 perfect; 85-94 excellent, only near-invisible noise; 70-84 usable with artefacts; below 70 failure.

Return JSON only:
{
  "score": number,
  "verdict": "PASS" | "RETRY",
  "reason": "diagnostic of what remains or what was damaged",
  "improvedPrompt": "revised erase instructions that fix the failure, naming where remnants are"
}"#;

/// Fill the Analyst template for one element.
pub fn analyst_prompt(
    element_type: ElementType,
    description: Option<&str>,
    background_color: &str,
) -> String {
    ANALYST_TEMPLATE
        .replace("{type}", element_type.as_str())
        .replace("{description}", description.unwrap_or("object"))
        .replace("{bgColor}", background_color)
}

/// Fill the Critic template with the Analyst's goal.
pub fn critic_prompt(cleaning_goal: &str) -> String {
    CRITIC_TEMPLATE.replace("{cleaningGoal}", cleaning_goal)
}

/// Wrap the current plan into the instruction sent with the square crop.
pub fn cleaner_instruction(prompt: &str) -> String {
    format!(
        "ERASE TASK: {prompt}\n\nMaintain target object fidelity. Output on pure white #FFFFFF background."
    )
}

/// Deterministic prompt used when the Analyst reply is unusable.
pub fn fallback_cleaning_prompt(element_type: ElementType, description: Option<&str>) -> String {
    let target = match description {
        Some(d) if !d.trim().is_empty() => format!("the {}", d.trim()),
        _ => "the main subject".to_string(),
    };
    let keep = match element_type {
        ElementType::Image => "Keep the photographic detail; remove only overlaid text and labels.",
        _ => "COMPLETELY WIPE all internal text, labels, and nested icons.",
    };
    format!(
        "ERASE TASK: Isolate {target}.\n1. {keep}\n2. Maintain the base {element_type} colors, gradients, and borders.\n3. Output on solid white #FFFFFF."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_prompt_carries_the_reply_schema() {
        assert!(DETECTION_PROMPT.contains("\"backgroundColor\": \"#RRGGBB\""));
        assert!(DETECTION_PROMPT.contains("box_2d"));
        assert!(DETECTION_PROMPT.contains("z_order"));
        assert!(DETECTION_PROMPT.trim_end().ends_with('}'));
    }

    #[test]
    fn text_prompt_names_every_reply_field() {
        for field in ["\"text\"", "\"hexColor\": \"#RRGGBB\"", "\"isBold\"", "\"lineCount\""] {
            assert!(TEXT_EXTRACTION_PROMPT.contains(field), "missing {field}");
        }
    }

    #[test]
    fn analyst_prompt_fills_every_placeholder() {
        let p = analyst_prompt(ElementType::Icon, Some("gear icon"), "#1E1E1E");
        assert!(p.contains("TARGET TYPE: ICON"));
        assert!(p.contains("gear icon"));
        assert!(p.contains("#1E1E1E"));
        assert!(!p.contains("{type}"));
        assert!(!p.contains("{description}"));
        assert!(!p.contains("{bgColor}"));
    }

    #[test]
    fn analyst_prompt_defaults_description() {
        let p = analyst_prompt(ElementType::Shape, None, DEFAULT_BACKGROUND_COLOR);
        assert!(p.contains("TARGET SUBJECT: object"));
    }

    #[test]
    fn critic_prompt_carries_goal() {
        let p = critic_prompt("Isolate the blue card.");
        assert!(p.contains("GOAL: Isolate the blue card."));
        assert!(!p.contains("{cleaningGoal}"));
    }

    #[test]
    fn fallback_prompt_mentions_type_and_subject() {
        let p = fallback_cleaning_prompt(ElementType::Shape, Some("rounded card"));
        assert!(p.contains("Isolate the rounded card"));
        assert!(p.contains("SHAPE"));
        assert!(p.contains("#FFFFFF"));

        let p = fallback_cleaning_prompt(ElementType::Image, Some("  "));
        assert!(p.contains("the main subject"));
        assert!(p.contains("photographic detail"));
    }

    #[test]
    fn cleaner_instruction_wraps_prompt() {
        let p = cleaner_instruction("Remove the caption.");
        assert!(p.starts_with("ERASE TASK: Remove the caption."));
    }
}
