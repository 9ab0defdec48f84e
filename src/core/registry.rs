use crate::core::error::RegistryError;
use crate::core::model::{Job, JobId, JobLease, JobSnapshot};
use parking_lot::{Mutex, MutexGuard};
use std::path::PathBuf;
use tracing::debug;

/// Holds at most one job. Every slot mutation goes through the same lock, which is also the
/// lock the coordinator holds while applying engine events.
#[derive(Default)]
pub struct JobRegistry {
    slot: Mutex<Option<Job>>,
}

pub type SlotGuard<'a> = MutexGuard<'a, Option<Job>>;

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_occupy(&self, resource_id: &str, destination: PathBuf) -> Result<JobLease, RegistryError> {
        let mut slot = self.slot.lock();
        if let Some(current) = slot.as_ref() {
            if current.resource_id == resource_id {
                debug!(job = %current.id, resource_id, "duplicate start for the active resource");
            }
            return Err(RegistryError::AlreadyActive);
        }
        let job = Job::new(resource_id.to_string(), destination);
        let lease = job.lease.clone();
        *slot = Some(job);
        Ok(lease)
    }

    pub fn peek(&self) -> Option<JobSnapshot> {
        self.slot.lock().as_ref().map(Job::snapshot)
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Clears the slot if `job_id` still owns it.
    pub fn release(&self, job_id: JobId) -> Option<Job> {
        let mut slot = self.slot.lock();
        vacate_if_owner(&mut slot, job_id)
    }

    pub(crate) fn lock(&self) -> SlotGuard<'_> {
        self.slot.lock()
    }
}

/// Borrow the job only when `job_id` owns the slot.
pub(crate) fn owned_by(slot: &mut Option<Job>, job_id: JobId) -> Option<&mut Job> {
    slot.as_mut().filter(|job| job.id == job_id)
}

pub(crate) fn vacate_if_owner(slot: &mut Option<Job>, job_id: JobId) -> Option<Job> {
    if slot.as_ref().map(|job| job.id) != Some(job_id) {
        return None;
    }
    let job = slot.take()?;
    job.lease.released.cancel();
    Some(job)
}
