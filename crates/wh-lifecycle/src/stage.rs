//! Stage names and the immutable invocation context.

use uuid::Uuid;

/// The eighteen execution points. `ImmediateAsync` and `DistributeAsync`
/// have no inline counterpart; the remaining eight points come in
/// async/inline pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleStage {
    ImmediateAsync,
    PreDistributeAsync,
    PreDistributeInline,
    DistributeAsync,
    PostDistributeAsync,
    PostDistributeInline,
    PreOutboxAsync,
    PreOutboxInline,
    PostOutboxAsync,
    PostOutboxInline,
    PreInboxAsync,
    PreInboxInline,
    PostInboxAsync,
    PostInboxInline,
    PrePerspectiveAsync,
    PrePerspectiveInline,
    PostPerspectiveAsync,
    PostPerspectiveInline,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 18] = [
        LifecycleStage::ImmediateAsync,
        LifecycleStage::PreDistributeAsync,
        LifecycleStage::PreDistributeInline,
        LifecycleStage::DistributeAsync,
        LifecycleStage::PostDistributeAsync,
        LifecycleStage::PostDistributeInline,
        LifecycleStage::PreOutboxAsync,
        LifecycleStage::PreOutboxInline,
        LifecycleStage::PostOutboxAsync,
        LifecycleStage::PostOutboxInline,
        LifecycleStage::PreInboxAsync,
        LifecycleStage::PreInboxInline,
        LifecycleStage::PostInboxAsync,
        LifecycleStage::PostInboxInline,
        LifecycleStage::PrePerspectiveAsync,
        LifecycleStage::PrePerspectiveInline,
        LifecycleStage::PostPerspectiveAsync,
        LifecycleStage::PostPerspectiveInline,
    ];

    /// Inline stages block the current unit; their failures propagate.
    pub fn is_inline(self) -> bool {
        matches!(
            self,
            LifecycleStage::PreDistributeInline
                | LifecycleStage::PostDistributeInline
                | LifecycleStage::PreOutboxInline
                | LifecycleStage::PostOutboxInline
                | LifecycleStage::PreInboxInline
                | LifecycleStage::PostInboxInline
                | LifecycleStage::PrePerspectiveInline
                | LifecycleStage::PostPerspectiveInline
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStage::ImmediateAsync => "ImmediateAsync",
            LifecycleStage::PreDistributeAsync => "PreDistributeAsync",
            LifecycleStage::PreDistributeInline => "PreDistributeInline",
            LifecycleStage::DistributeAsync => "DistributeAsync",
            LifecycleStage::PostDistributeAsync => "PostDistributeAsync",
            LifecycleStage::PostDistributeInline => "PostDistributeInline",
            LifecycleStage::PreOutboxAsync => "PreOutboxAsync",
            LifecycleStage::PreOutboxInline => "PreOutboxInline",
            LifecycleStage::PostOutboxAsync => "PostOutboxAsync",
            LifecycleStage::PostOutboxInline => "PostOutboxInline",
            LifecycleStage::PreInboxAsync => "PreInboxAsync",
            LifecycleStage::PreInboxInline => "PreInboxInline",
            LifecycleStage::PostInboxAsync => "PostInboxAsync",
            LifecycleStage::PostInboxInline => "PostInboxInline",
            LifecycleStage::PrePerspectiveAsync => "PrePerspectiveAsync",
            LifecycleStage::PrePerspectiveInline => "PrePerspectiveInline",
            LifecycleStage::PostPerspectiveAsync => "PostPerspectiveAsync",
            LifecycleStage::PostPerspectiveInline => "PostPerspectiveInline",
        }
    }
}

impl std::fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a message under lifecycle invocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    Outbox,
    Inbox,
}

/// Immutable context handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    pub stage: LifecycleStage,
    pub message_type: String,
    pub message_id: Option<Uuid>,
    pub stream_id: Option<String>,
    pub perspective_name: Option<String>,
    pub source: Option<MessageSource>,
    pub attempt: i32,
}

impl LifecycleContext {
    pub fn new(stage: LifecycleStage, message_type: impl Into<String>) -> Self {
        Self {
            stage,
            message_type: message_type.into(),
            message_id: None,
            stream_id: None,
            perspective_name: None,
            source: None,
            attempt: 0,
        }
    }

    pub fn with_message(mut self, message_id: Uuid, source: MessageSource) -> Self {
        self.message_id = Some(message_id);
        self.source = Some(source);
        self
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn with_perspective(mut self, perspective_name: impl Into<String>) -> Self {
        self.perspective_name = Some(perspective_name.into());
        self
    }

    pub fn with_attempt(mut self, attempt: i32) -> Self {
        self.attempt = attempt;
        self
    }

    /// The same context at a different stage. Used by callers that fire the
    /// async and inline variants of one point back to back.
    pub fn at_stage(&self, stage: LifecycleStage) -> Self {
        let mut ctx = self.clone();
        ctx.stage = stage;
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn there_are_eighteen_stages() {
        assert_eq!(LifecycleStage::ALL.len(), 18);
    }

    #[test]
    fn exactly_eight_inline_stages() {
        let inline = LifecycleStage::ALL.iter().filter(|s| s.is_inline()).count();
        assert_eq!(inline, 8);
    }

    #[test]
    fn immediate_and_distribute_are_async_only() {
        assert!(!LifecycleStage::ImmediateAsync.is_inline());
        assert!(!LifecycleStage::DistributeAsync.is_inline());
        assert!(!LifecycleStage::ALL
            .iter()
            .any(|s| s.as_str() == "ImmediateInline" || s.as_str() == "DistributeInline"));
    }
}
