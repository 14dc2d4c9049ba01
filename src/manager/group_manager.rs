//! Manager-side handle of one process group.

use crate::algs::comm_group::{tags, CommGroup};
use crate::algs::communicator::{Communicator, Wait};
use crate::algs::wire::cast_slice;
use crate::combi_error::CombiError;
use crate::manager::signals::{Signal, Status};
use crate::manager::task::TaskId;
use std::time::Duration;

/// Tracks the status of one group and issues signals to its master. The
/// status only changes when it is polled, so a group stays `Busy` from the
/// moment a signal is sent until the manager observes the reply.
pub struct ProcessGroupManager<'s, C: Communicator> {
    global: &'s CommGroup<C>,
    group: usize,
    status: Status,
    pending_status: Option<C::RecvHandle>,
    pending_result: Option<C::RecvHandle>,
    result: Option<Vec<u8>>,
    tasks: Vec<TaskId>,
    load: f64,
    poll_interval: Duration,
}

impl<'s, C: Communicator> ProcessGroupManager<'s, C> {
    pub fn new(global: &'s CommGroup<C>, group: usize, poll_interval: Duration) -> Self {
        Self {
            global,
            group,
            status: Status::Wait,
            pending_status: None,
            pending_result: None,
            result: None,
            tasks: Vec::new(),
            load: 0.0,
            poll_interval,
        }
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    /// Accumulated estimated runtime of the tasks on this group.
    pub fn load(&self) -> f64 {
        self.load
    }

    pub(crate) fn assign(&mut self, id: TaskId, estimate: f64) {
        self.tasks.push(id);
        self.load += estimate;
    }

    pub(crate) fn unassign(&mut self, id: TaskId) {
        self.tasks.retain(|&t| t != id);
    }

    /// Last known status, without polling.
    pub fn cached_status(&self) -> Status {
        self.status
    }

    /// Poll the outstanding status reply without blocking. A `Fail` reply
    /// surfaces once as [`CombiError::GroupFailed`]; the group is `Wait`
    /// afterwards.
    pub fn status(&mut self) -> Result<Status, CombiError> {
        let done = self.pending_status.as_ref().is_some_and(|h| h.is_complete());
        if done {
            self.finish_signal()?;
        }
        Ok(self.status)
    }

    pub fn is_ready(&mut self) -> Result<bool, CombiError> {
        Ok(self.status()? == Status::Wait)
    }

    /// Poll with a short sleep until the group is back in `Wait`.
    pub fn wait_status(&mut self) -> Result<(), CombiError> {
        while self.status()? == Status::Busy {
            std::thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    fn finish_signal(&mut self) -> Result<(), CombiError> {
        if let Some(h) = self.pending_result.take() {
            self.result = Some(self.global.complete(self.group, tags::RESULT, h)?);
        }
        if let Some(h) = self.pending_status.take() {
            let raw = self.global.complete(self.group, tags::STATUS, h)?;
            match Status::decode(&raw, self.global.world_rank(self.group))? {
                Status::Fail => {
                    // the group is back in its wait loop
                    self.status = Status::Wait;
                    self.result = None;
                    log::warn!("group {} reported a failed handler", self.group);
                    return Err(CombiError::GroupFailed { group: self.group });
                }
                status => self.status = status,
            }
        }
        Ok(())
    }

    /// Issue `signal` (with `payload` when the signal carries one). Fails with
    /// [`CombiError::GroupBusy`] before anything is sent if the group is not
    /// known to be waiting.
    pub fn send_signal(&mut self, signal: Signal, payload: &[u8]) -> Result<(), CombiError> {
        if self.status != Status::Wait {
            return Err(CombiError::GroupBusy { group: self.group });
        }
        self.result = None;
        if signal.has_result() {
            self.pending_result = Some(self.global.irecv(self.group, tags::RESULT));
        }
        self.global.send(self.group, tags::SIGNAL, cast_slice(&[signal.to_wire()]));
        if signal.has_payload() {
            self.global.send(self.group, tags::PAYLOAD, payload);
        }
        if signal.has_status() {
            self.status = Status::Busy;
            self.pending_status = Some(self.global.irecv(self.group, tags::STATUS));
        }
        log::debug!("group {}: sent {signal:?}", self.group);
        Ok(())
    }

    /// Block until the group is idle and hand out the result of the last
    /// signal, if it had one.
    pub fn take_result(&mut self) -> Result<Option<Vec<u8>>, CombiError> {
        self.wait_status()?;
        Ok(self.result.take())
    }
}
