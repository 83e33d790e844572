//! Wellbeing tools for the supportive persona. Pure, no backend calls.

use async_trait::async_trait;
use clinscribe_core::error::ToolError;
use clinscribe_core::tool::{ToolContext, ToolExecutor, ToolKind};
use serde_json::json;

pub struct WellbeingTool {
    kind: ToolKind,
}

impl WellbeingTool {
    /// Returns `None` for kinds that are not wellbeing tools.
    pub fn new(kind: ToolKind) -> Option<Self> {
        matches!(
            kind,
            ToolKind::MoodCheckIn | ToolKind::CopingStrategies | ToolKind::BreathingExercise
        )
        .then_some(Self { kind })
    }
}

fn mood_check_in(args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
    let mood = args["current_mood"]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments("Missing 'current_mood' argument".into()))?;
    let scale = args["mood_scale"]
        .as_i64()
        .filter(|s| (1..=10).contains(s))
        .ok_or_else(|| ToolError::InvalidArguments("'mood_scale' must be an integer from 1 to 10".into()))?;

    let insights = match scale {
        1..=3 => [
            "I notice you're having a difficult time. That takes courage to share.",
            "Difficult emotions are temporary and valid.",
        ],
        4..=6 => [
            "It sounds like you're experiencing some challenges today.",
            "Let's explore what might help you feel more balanced.",
        ],
        _ => [
            "I'm glad to hear you're feeling relatively well today.",
            "What's contributing to this positive mood?",
        ],
    };

    Ok(json!({
        "mood": mood,
        "scale": scale,
        "insights": insights,
        "suggestions": ["Consider journaling about this mood", "Practice gratitude", "Connect with supportive people"]
    }))
}

fn coping_strategies(args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
    let situation = args["situation"]
        .as_str()
        .ok_or_else(|| ToolError::InvalidArguments("Missing 'situation' argument".into()))?;

    Ok(json!({
        "situation_acknowledged": situation,
        "strategies": {
            "immediate": [
                "Take three deep breaths",
                "Ground yourself using the 5-4-3-2-1 technique",
                "Practice progressive muscle relaxation"
            ],
            "short_term": [
                "Go for a walk or light exercise",
                "Call a trusted friend or family member",
                "Engage in a creative activity"
            ],
            "long_term": [
                "Establish a regular sleep schedule",
                "Practice mindfulness meditation",
                "Consider journaling regularly"
            ]
        },
        "reminder": "It's okay to ask for professional help if you need additional support."
    }))
}

fn breathing_exercise(args: &serde_json::Value) -> Result<serde_json::Value, ToolError> {
    let (name, pattern) = match args["exercise_type"].as_str().unwrap_or("box_breathing") {
        "4_7_8" => ("4-7-8 Breathing", "Inhale for 4, hold for 7, exhale for 8"),
        "belly_breathing" => ("Belly Breathing", "Slow, deep breaths expanding your belly"),
        _ => ("Box Breathing", "Inhale for 4, hold for 4, exhale for 4, hold for 4"),
    };
    let minutes = args["duration_minutes"].as_u64().unwrap_or(5).clamp(1, 30);

    Ok(json!({
        "exercise": { "name": name, "pattern": pattern },
        "duration_minutes": minutes,
        "instructions": [
            "Find a comfortable position, sitting or lying down",
            "Close your eyes or soften your gaze",
            format!("Follow this pattern: {pattern}"),
            "Continue for the recommended duration",
            "Notice how you feel afterward"
        ]
    }))
}

#[async_trait]
impl ToolExecutor for WellbeingTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn description(&self) -> &str {
        match self.kind {
            ToolKind::MoodCheckIn => "Record how the person feels right now on a 1-10 scale and reflect on it.",
            ToolKind::CopingStrategies => "Offer immediate, short-term and long-term coping strategies for a situation.",
            _ => "Guide a breathing exercise (box_breathing, 4_7_8 or belly_breathing).",
        }
    }

    fn parameters_schema(&self) -> serde_json::Value {
        match self.kind {
            ToolKind::MoodCheckIn => json!({
                "type": "object",
                "properties": {
                    "current_mood": { "type": "string" },
                    "mood_scale": { "type": "integer", "minimum": 1, "maximum": 10 }
                },
                "required": ["current_mood", "mood_scale"]
            }),
            ToolKind::CopingStrategies => json!({
                "type": "object",
                "properties": {
                    "situation": { "type": "string" },
                    "preferred_techniques": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["situation"]
            }),
            _ => json!({
                "type": "object",
                "properties": {
                    "exercise_type": { "type": "string", "enum": ["box_breathing", "4_7_8", "belly_breathing"] },
                    "duration_minutes": { "type": "integer", "default": 5 }
                }
            }),
        }
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        match self.kind {
            ToolKind::MoodCheckIn => mood_check_in(&arguments),
            ToolKind::CopingStrategies => coping_strategies(&arguments),
            _ => breathing_exercise(&arguments),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mood_scale_shapes_insights() {
        let tool = WellbeingTool::new(ToolKind::MoodCheckIn).unwrap();
        let low = tool
            .execute(&ToolContext::default(), json!({ "current_mood": "tired", "mood_scale": 2 }))
            .await
            .unwrap();
        assert!(low["insights"][0].as_str().unwrap().contains("difficult"));

        let err = tool
            .execute(&ToolContext::default(), json!({ "current_mood": "ok", "mood_scale": 11 }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn breathing_defaults_to_box() {
        let tool = WellbeingTool::new(ToolKind::BreathingExercise).unwrap();
        let out = tool.execute(&ToolContext::default(), json!({})).await.unwrap();
        assert_eq!(out["exercise"]["name"], "Box Breathing");
        assert_eq!(out["duration_minutes"], 5);
    }

    #[test]
    fn only_wellbeing_kinds_construct() {
        assert!(WellbeingTool::new(ToolKind::CopingStrategies).is_some());
        assert!(WellbeingTool::new(ToolKind::GetTemplates).is_none());
    }
}
