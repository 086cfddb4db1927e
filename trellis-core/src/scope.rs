//! Per-request tenant scoping
//!
//! Every storage and service operation takes a [`RequestScope`]: there is no
//! unscoped code path, which is how cross-tenant access is made impossible
//! by construction rather than by discipline.

use crate::{ActorId, StorageError, TenantId};
use std::time::{Duration, Instant};

/// Tenant, actor, and deadline context for one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestScope {
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    /// Absolute deadline; storage calls check it before and during I/O.
    pub deadline: Option<Instant>,
}

impl RequestScope {
    pub fn new(tenant_id: TenantId, actor_id: ActorId) -> Self {
        Self {
            tenant_id,
            actor_id,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Time remaining before the deadline, or `None` when unbounded.
    /// Fails with `DeadlineExceeded` once the deadline has passed.
    pub fn remaining(&self) -> Result<Option<Duration>, StorageError> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(StorageError::DeadlineExceeded)
                } else {
                    Ok(Some(deadline - now))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordIdType;

    #[test]
    fn test_unbounded_scope() {
        let scope = RequestScope::new(TenantId::now_v7(), ActorId::now_v7());
        assert_eq!(scope.remaining().expect("no deadline"), None);
    }

    #[test]
    fn test_expired_deadline() {
        let scope = RequestScope::new(TenantId::now_v7(), ActorId::now_v7())
            .with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(scope.remaining(), Err(StorageError::DeadlineExceeded));
    }

    #[test]
    fn test_future_deadline() {
        let scope = RequestScope::new(TenantId::now_v7(), ActorId::now_v7())
            .with_timeout(Duration::from_secs(30));
        let remaining = scope.remaining().expect("not expired").expect("bounded");
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(29));
    }
}
