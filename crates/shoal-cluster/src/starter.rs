//! Parallel fan-out of member start effectors.

use crate::entity::ClusterMember;
use crate::error::{ClusterError, ClusterResult};
use crate::location::Location;
use shoal_core::runtime::Runtime;
use std::sync::Arc;
use tracing::{debug, error};

/// Outcome of one member's start effector
pub struct StartOutcome {
    pub member: Arc<dyn ClusterMember>,
    pub location: Location,
    /// Absent on success
    pub error: Option<ClusterError>,
}

impl StartOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Fans start effectors out across worker tasks and collects per-member
/// errors.
///
/// A member failing to start never fails the batch; its error is collected
/// so the caller can quarantine or discard it. Outcomes come back in
/// submission order regardless of completion order. Interruption of the
/// awaiting task (cancellation, panic) is fatal and propagates immediately.
#[derive(Debug, Clone)]
pub struct ParallelStarter<RT: Runtime> {
    runtime: RT,
}

impl<RT: Runtime + 'static> ParallelStarter<RT> {
    pub fn new(runtime: RT) -> Self {
        Self { runtime }
    }

    /// Start every `(member, location)` pair in parallel.
    ///
    /// Non-startable members are recorded as immediate successes without a
    /// task.
    pub async fn start_all(
        &self,
        work: Vec<(Arc<dyn ClusterMember>, Location)>,
    ) -> ClusterResult<Vec<StartOutcome>> {
        let mut handles = Vec::with_capacity(work.len());
        for (member, location) in &work {
            if !member.is_startable() {
                handles.push(None);
                continue;
            }
            let member = Arc::clone(member);
            let location = location.clone();
            handles.push(Some(
                self.runtime
                    .spawn(async move { member.start(&location).await }),
            ));
        }

        let mut outcomes = Vec::with_capacity(work.len());
        for ((member, location), handle) in work.into_iter().zip(handles) {
            let result = match handle {
                None => Ok(()),
                Some(handle) => match handle.await {
                    Ok(result) => result,
                    Err(join_err) => {
                        return Err(ClusterError::Interrupted {
                            reason: join_err.to_string(),
                        });
                    }
                },
            };

            let error = match result {
                Ok(()) => None,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(member = %member.id(), error = %e, "failed to start member (removing)");
                    debug!(member = %member.id(), error = ?e, "start failure detail");
                    Some(e)
                }
            };

            outcomes.push(StartOutcome {
                member,
                location,
                error,
            });
        }

        Ok(outcomes)
    }
}
