//! The unit of work: everything accumulated between flushes.

use wh_schemas::{
    BatchFlags, CompletionReport, CoordinationSettings, FailureReport, NewInboxMessage,
    NewOutboxMessage, PerspectiveCompletion, PerspectiveFailure, ReceptorCompletion,
    ServiceInstance, WorkBatchRequest,
};

#[derive(Debug, Default, Clone)]
pub struct UnitOfWork {
    pub new_outbox: Vec<NewOutboxMessage>,
    pub new_inbox: Vec<NewInboxMessage>,
    pub renew_outbox: Vec<uuid::Uuid>,
    pub renew_inbox: Vec<uuid::Uuid>,
    pub outbox_completions: Vec<CompletionReport>,
    pub inbox_completions: Vec<CompletionReport>,
    pub outbox_failures: Vec<FailureReport>,
    pub inbox_failures: Vec<FailureReport>,
    pub receptor_completions: Vec<ReceptorCompletion>,
    pub perspective_completions: Vec<PerspectiveCompletion>,
    pub perspective_failures: Vec<PerspectiveFailure>,
}

impl UnitOfWork {
    pub fn len(&self) -> usize {
        self.new_outbox.len()
            + self.new_inbox.len()
            + self.renew_outbox.len()
            + self.renew_inbox.len()
            + self.outbox_completions.len()
            + self.inbox_completions.len()
            + self.outbox_failures.len()
            + self.inbox_failures.len()
            + self.receptor_completions.len()
            + self.perspective_completions.len()
            + self.perspective_failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge `other` back in front of the current content. Used to restore
    /// a taken unit after a failed coordinator call without reordering
    /// anything queued meanwhile.
    pub fn restore_front(&mut self, mut other: UnitOfWork) {
        fn prepend<T>(dst: &mut Vec<T>, src: &mut Vec<T>) {
            src.append(dst);
            std::mem::swap(dst, src);
        }

        prepend(&mut self.new_outbox, &mut other.new_outbox);
        prepend(&mut self.new_inbox, &mut other.new_inbox);
        prepend(&mut self.renew_outbox, &mut other.renew_outbox);
        prepend(&mut self.renew_inbox, &mut other.renew_inbox);
        prepend(&mut self.outbox_completions, &mut other.outbox_completions);
        prepend(&mut self.inbox_completions, &mut other.inbox_completions);
        prepend(&mut self.outbox_failures, &mut other.outbox_failures);
        prepend(&mut self.inbox_failures, &mut other.inbox_failures);
        prepend(&mut self.receptor_completions, &mut other.receptor_completions);
        prepend(&mut self.perspective_completions, &mut other.perspective_completions);
        prepend(&mut self.perspective_failures, &mut other.perspective_failures);
    }

    pub fn into_request(
        self,
        instance: ServiceInstance,
        settings: CoordinationSettings,
        flags: BatchFlags,
    ) -> WorkBatchRequest {
        WorkBatchRequest {
            instance,
            new_outbox: self.new_outbox,
            new_inbox: self.new_inbox,
            renew_outbox: self.renew_outbox,
            renew_inbox: self.renew_inbox,
            outbox_completions: self.outbox_completions,
            inbox_completions: self.inbox_completions,
            outbox_failures: self.outbox_failures,
            inbox_failures: self.inbox_failures,
            receptor_completions: self.receptor_completions,
            perspective_completions: self.perspective_completions,
            perspective_failures: self.perspective_failures,
            settings,
            flags,
        }
    }
}
