//! Conversation model: messages, feedback, prompt bookkeeping, lifecycle.
//!
//! A [`Conversation`] is the durable record a session attaches to. Messages
//! are append-only; their order is the order in which the relay accepted
//! them. The [`PromptData`] sub-record tracks what the asynchronous worker
//! needs: turn count, last activity, whether a summary was requested, and the
//! running "selected question" counter that drives the [`Phase`].

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, FeedbackId, MessageId};

/// Author tag for messages typed by the human client.
pub const ROLE_USER: &str = "user";
/// Author tag for relay-generated greetings.
pub const ROLE_SYSTEM: &str = "system";
/// Conversation role that receives the extended lifetime by default.
pub const ROLE_SPECIALIST: &str = "specialist";
/// Default conversation role.
pub const ROLE_PILOT: &str = "pilot";

// ─────────────────────────────────────────────────────────────────────────────
// Phase
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse conversation stage attached to each message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Opening small talk; no question selected yet.
    #[default]
    Rapport,
    /// Working through the question set.
    Explore,
    /// Question set exhausted.
    End,
}

impl Phase {
    /// Selected-question count at which the conversation enters [`Phase::End`].
    pub const END_THRESHOLD: u32 = 12;

    /// Derive the phase from the running selected-question counter.
    pub fn from_selected_questions(count: u32) -> Self {
        match count {
            0 => Self::Rapport,
            n if n < Self::END_THRESHOLD => Self::Explore,
            _ => Self::End,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rapport => "rapport",
            Self::Explore => "explore",
            Self::End => "end",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages and feedback
// ─────────────────────────────────────────────────────────────────────────────

/// Feedback slot, attached to a conversation or to a single message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    /// Slot identity; clients address feedback by this ID.
    pub id: FeedbackId,
    /// Whether feedback has been given.
    #[serde(default)]
    pub status: bool,
    /// Free-form feedback text.
    #[serde(default)]
    pub message: String,
    /// Numeric score.
    #[serde(default)]
    pub score: i32,
}

impl Feedback {
    /// A fresh, unfilled feedback slot.
    pub fn empty() -> Self {
        Self {
            id: FeedbackId::new(),
            status: false,
            message: String::new(),
            score: 0,
        }
    }

    /// A filled slot for `id`.
    pub fn given(id: FeedbackId, message: String, score: i32) -> Self {
        Self {
            id,
            status: true,
            message,
            score,
        }
    }
}

impl Default for Feedback {
    fn default() -> Self {
        Self::empty()
    }
}

/// A single stored message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message identity.
    pub id: MessageId,
    /// Author tag (`user`, `system`, or the worker identity).
    pub role: String,
    /// Message text.
    pub message: String,
    /// When the relay accepted the message.
    #[serde(rename = "createAt")]
    pub created_at: DateTime<Utc>,
    /// Worker reasoning annotation; empty for user messages.
    #[serde(default)]
    pub reasoning: String,
    /// Conversation phase at the time of the message.
    #[serde(default)]
    pub phase: Phase,
    /// Per-message feedback slot.
    #[serde(default)]
    pub feedback: Feedback,
}

impl Message {
    /// Build a new message stamped with the current time and an empty feedback slot.
    pub fn new(role: impl Into<String>, text: impl Into<String>, phase: Phase, reasoning: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: role.into(),
            message: text.into(),
            created_at: Utc::now(),
            reasoning: reasoning.into(),
            phase,
            feedback: Feedback::empty(),
        }
    }
}

/// Bookkeeping consumed by the asynchronous worker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptData {
    /// Whether a summary has already been requested.
    #[serde(rename = "summaryState")]
    pub summary_sent: bool,
    /// Number of user turns dispatched to the worker.
    pub turn: u32,
    /// Time of the most recent message.
    pub time_last_message: Option<DateTime<Utc>>,
    /// Running count reported by the worker; drives [`Phase`].
    pub number_of_selected_question: u32,
}

impl PromptData {
    /// Phase implied by the current selected-question counter.
    pub fn phase(&self) -> Phase {
        Phase::from_selected_questions(self.number_of_selected_question)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summary sheet
// ─────────────────────────────────────────────────────────────────────────────

/// Summary produced by the worker once a conversation goes idle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySheet {
    /// Who the conversation was with.
    #[serde(rename = "basic_info", default)]
    pub basic: BasicInfo,
    /// What came up.
    #[serde(rename = "insight_info", default)]
    pub insight: InsightInfo,
}

/// Basic details about the service recipient.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicInfo {
    /// Name.
    pub name: String,
    /// Gender.
    pub gender: String,
    /// Age in years.
    pub age: u32,
    /// Service date.
    pub service_date: Option<DateTime<Utc>>,
}

/// Insight details extracted from the conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct InsightInfo {
    pub issue: String,
    pub duration: String,
    pub feelings: String,
    pub coping_behaviors: String,
    pub physical_symptoms: String,
    pub other_symptoms: String,
    pub chronic_illness: String,
    pub psychiatric_history: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Conversation lifecycle. `Terminated` is absorbing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationStatus {
    /// Created, never admitted.
    #[default]
    #[serde(rename = "not started")]
    NotStarted,
    /// A session was admitted; the lifetime clock is running.
    #[serde(rename = "processing")]
    Processing,
    /// Finished explicitly or by exceeding its lifetime.
    #[serde(rename = "completed")]
    Completed,
    /// Invalidated upstream.
    #[serde(rename = "terminated")]
    Terminated,
}

impl ConversationStatus {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not started",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
        }
    }

    /// Whether the conversation no longer accepts sessions.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }
}

/// How long a conversation may stay in `processing`.
#[derive(Clone, Debug)]
pub struct LifecyclePolicy {
    /// Lifetime for ordinary roles.
    pub lifetime: TimeDelta,
    /// Role granted the extended lifetime.
    pub privileged_role: String,
    /// Lifetime for the privileged role.
    pub privileged_lifetime: TimeDelta,
}

impl LifecyclePolicy {
    /// Lifetime applicable to `role`.
    pub fn lifetime_for(&self, role: &str) -> TimeDelta {
        if role == self.privileged_role {
            self.privileged_lifetime
        } else {
            self.lifetime
        }
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            lifetime: TimeDelta::hours(24),
            privileged_role: ROLE_SPECIALIST.into(),
            privileged_lifetime: TimeDelta::hours(72),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation
// ─────────────────────────────────────────────────────────────────────────────

/// The durable conversation record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation identity.
    pub id: ConversationId,
    /// Messages in acceptance order.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Conversation-level feedback slot.
    #[serde(default)]
    pub feedback: Feedback,
    /// Worker-produced summary.
    #[serde(default)]
    pub summary_sheet: SummarySheet,
    /// Prompt template revision used by the worker.
    #[serde(default)]
    pub prompt_version: u32,
    /// Worker bookkeeping.
    #[serde(rename = "providePromptData", default)]
    pub prompt_data: PromptData,
    /// Lifecycle status.
    #[serde(default)]
    pub status: ConversationStatus,
    /// When the conversation entered `processing`.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Conversation role (`pilot`, `specialist`).
    #[serde(default)]
    pub role: String,
    /// Upstream session reference.
    #[serde(default)]
    pub session_id: String,
    /// Upstream batch reference.
    #[serde(default)]
    pub batch_id: String,
    /// Last durable write.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh conversation in `not started`.
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            feedback: Feedback::empty(),
            summary_sheet: SummarySheet::default(),
            prompt_version: 0,
            prompt_data: PromptData::default(),
            status: ConversationStatus::NotStarted,
            start_time: None,
            role: ROLE_PILOT.into(),
            session_id: String::new(),
            batch_id: String::new(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the conversation no longer accepts sessions.
    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// `not started → processing` on first admission; stamps the start time once.
    ///
    /// Returns `true` if the status changed.
    pub fn begin(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ConversationStatus::NotStarted {
            return false;
        }
        self.status = ConversationStatus::Processing;
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        true
    }

    /// Lazy `processing → completed` once the role's lifetime has elapsed.
    ///
    /// Returns `true` if the status changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>, policy: &LifecyclePolicy) -> bool {
        if self.status != ConversationStatus::Processing {
            return false;
        }
        let Some(start) = self.start_time else {
            return false;
        };
        if now.signed_duration_since(start) < policy.lifetime_for(&self.role) {
            return false;
        }
        self.status = ConversationStatus::Completed;
        true
    }

    /// Explicit completion.
    pub fn complete(&mut self) {
        if self.status != ConversationStatus::Terminated {
            self.status = ConversationStatus::Completed;
        }
    }

    /// Invalidate the conversation from any state.
    pub fn terminate(&mut self) {
        self.status = ConversationStatus::Terminated;
    }

    /// Message whose feedback slot has `feedback_id`.
    pub fn message_by_feedback_mut(&mut self, feedback_id: &FeedbackId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.feedback.id == feedback_id)
    }

    /// Append a message and update the last-activity bookkeeping.
    pub fn record(&mut self, message: Message) {
        self.prompt_data.time_last_message = Some(message.created_at);
        self.messages.push(message);
    }
}
