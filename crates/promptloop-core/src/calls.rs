use chrono::{DateTime, Utc};
use promptloop_db::{CallRecord, PipelineRunRecord};
use serde::{Deserialize, Serialize};

/// One utterance of a recorded call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub speaker: String,
    pub text: String,
}

/// A finished call as delivered by the transcript feed. Read-only input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    #[serde(default)]
    pub transcript: Vec<TranscriptSegment>,
    #[serde(default)]
    pub risk_tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Iteration that handled the live call
    #[serde(default)]
    pub active_iteration_id: Option<i64>,
}

impl Call {
    pub fn to_record(&self) -> Result<CallRecord, serde_json::Error> {
        Ok(CallRecord {
            id: self.id.clone(),
            transcript: serde_json::to_string(&self.transcript)?,
            risk_tags: serde_json::to_string(&self.risk_tags)?,
            timestamp: self.timestamp,
            active_iteration_id: self.active_iteration_id,
        })
    }

    pub fn from_record(record: &CallRecord) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: record.id.clone(),
            transcript: serde_json::from_str(&record.transcript)?,
            risk_tags: serde_json::from_str(&record.risk_tags)?,
            timestamp: record.timestamp,
            active_iteration_id: record.active_iteration_id,
        })
    }

    /// A call with nothing said cannot drive an improvement
    pub fn is_evaluable(&self) -> bool {
        self.transcript.iter().any(|s| !s.text.trim().is_empty())
    }

    /// The recorded conversation as `Speaker: text` lines for the judge
    pub fn render_transcript(&self) -> String {
        self.transcript
            .iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| format!("{}: {}", speaker_label(&s.speaker), s.text.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Feed speakers are free-form; the judge sees the same labels as for
/// simulated conversations.
fn speaker_label(speaker: &str) -> &str {
    match speaker.trim().to_ascii_lowercase().as_str() {
        "agent" | "assistant" | "bot" => "Agent",
        "customer" | "user" | "caller" => "Customer",
        _ => speaker.trim(),
    }
}

/// Listing entry for evaluable calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub segments: usize,
    pub risk_tags: Vec<String>,
    pub active_iteration_id: Option<i64>,
    /// Status of the latest finished pipeline run, if any
    pub last_outcome: Option<String>,
}

impl CallSummary {
    pub fn new(call: &Call, latest_run: Option<&PipelineRunRecord>) -> Self {
        let last_outcome = latest_run
            .and_then(|run| run.outcome.as_deref())
            .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
            .and_then(|value| value.get("status")?.as_str().map(str::to_string));

        Self {
            id: call.id.clone(),
            timestamp: call.timestamp,
            segments: call.transcript.len(),
            risk_tags: call.risk_tags.clone(),
            active_iteration_id: call.active_iteration_id,
            last_outcome,
        }
    }

    pub fn processed(&self) -> bool {
        self.last_outcome.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_feed_json() {
        let json = r#"{
            "id": "room-42",
            "transcript": [
                {"speaker": "agent", "text": "Hi, this is Tira."},
                {"speaker": "customer", "text": "I lost my job.", "confidence": 0.93}
            ],
            "risk_tags": ["financial_hardship"],
            "timestamp": "2024-03-01T10:00:00Z",
            "active_iteration_id": 1
        }"#;

        let call: Call = serde_json::from_str(json).unwrap();
        assert_eq!(call.transcript.len(), 2);
        assert_eq!(call.risk_tags, vec!["financial_hardship"]);
        assert!(call.is_evaluable());

        let record = call.to_record().unwrap();
        assert_eq!(Call::from_record(&record).unwrap(), call);
    }

    #[test]
    fn test_render_transcript_labels_speakers() {
        let call: Call = serde_json::from_str(
            r#"{
                "id": "room-3",
                "transcript": [
                    {"speaker": "Assistant", "text": " Hi, this is Tira. "},
                    {"speaker": "user", "text": "   "},
                    {"speaker": "caller", "text": "Who is this?"},
                    {"speaker": "supervisor", "text": "Joining the call."}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(
            call.render_transcript(),
            "Agent: Hi, this is Tira.\nCustomer: Who is this?\nsupervisor: Joining the call."
        );
    }

    #[test]
    fn test_summary_reads_last_outcome() {
        let call: Call = serde_json::from_str(r#"{"id": "room-1"}"#).unwrap();
        assert!(!call.is_evaluable());

        let run = PipelineRunRecord {
            id: "run".to_string(),
            call_id: "room-1".to_string(),
            candidate_id: Some(2),
            outcome: Some(r#"{"status":"rolled_back","candidate_id":2}"#.to_string()),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };
        let summary = CallSummary::new(&call, Some(&run));
        assert_eq!(summary.last_outcome.as_deref(), Some("rolled_back"));
        assert!(summary.processed());
        assert!(!CallSummary::new(&call, None).processed());
    }
}
