//! Hostname resolution over the asynchronous lookup.
//!
//! The lookup's `found` callback writes into a `LookupCell`; the caller polls
//! the cell until it leaves `Pending`. A cache hit skips the wait entirely.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::FetchError;
use crate::poll::wait_for;
use crate::stack::{LookupStart, NetStack, StackGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Pending,
    Resolved(IpAddr),
    Failed,
}

/// Result cell written once by the lookup callback.
#[derive(Debug)]
pub struct LookupCell {
    state: Mutex<Lookup>,
}

impl LookupCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Lookup::Pending),
        })
    }

    pub fn get(&self) -> Lookup {
        *self.state.lock()
    }

    pub fn complete(&self, addr: Option<IpAddr>) {
        *self.state.lock() = match addr {
            Some(addr) => Lookup::Resolved(addr),
            None => Lookup::Failed,
        };
    }
}

/// Resolve `host`, polling every `interval` while the lookup is in flight.
///
/// Never returns if the stack never answers.
pub fn resolve<S: NetStack>(
    stack: &StackGuard<S>,
    host: &str,
    interval: Duration,
) -> Result<IpAddr, FetchError> {
    let cell = LookupCell::new();
    let found = {
        let cell = Arc::clone(&cell);
        Box::new(move |addr: Option<IpAddr>| cell.complete(addr))
    };

    let started = stack.lock().gethostbyname(host, found);
    match started {
        Ok(LookupStart::Resolved(addr)) => {
            debug!(host, %addr, "lookup answered from cache");
            Ok(addr)
        }
        Ok(LookupStart::InProgress) => wait_for(interval, || match cell.get() {
            Lookup::Pending => None,
            Lookup::Resolved(addr) => Some(Ok(addr)),
            Lookup::Failed => Some(Err(FetchError::Resolve {
                host: host.to_string(),
            })),
        }),
        Err(source) => Err(FetchError::ResolveStart {
            host: host.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DnsBehavior, Script, SimStack};
    use crate::stack::StackError;
    use std::net::Ipv4Addr;

    const POLL: Duration = Duration::from_millis(2);

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(185, 199, 108, 153))
    }

    #[test]
    fn cell_transitions_once_completed() {
        let cell = LookupCell::new();
        assert_eq!(cell.get(), Lookup::Pending);
        cell.complete(Some(addr()));
        assert_eq!(cell.get(), Lookup::Resolved(addr()));

        let failed = LookupCell::new();
        failed.complete(None);
        assert_eq!(failed.get(), Lookup::Failed);
    }

    #[test]
    fn cache_hit_returns_immediately() {
        let stack = SimStack::spawn(Script {
            dns: DnsBehavior::Cached(addr()),
            ..Script::default()
        });
        assert_eq!(resolve(&stack, "cards.example", POLL).unwrap(), addr());
    }

    #[test]
    fn async_answer_is_polled_for() {
        let stack = SimStack::spawn(Script {
            dns: DnsBehavior::Async(addr()),
            ..Script::default()
        });
        assert_eq!(resolve(&stack, "cards.example", POLL).unwrap(), addr());
        assert_eq!(stack.lock().ledger().lookups_started, 1);
    }

    #[test]
    fn missing_address_fails() {
        let stack = SimStack::spawn(Script {
            dns: DnsBehavior::Fail,
            ..Script::default()
        });
        let err = resolve(&stack, "cards.example", POLL).unwrap_err();
        assert!(matches!(err, FetchError::Resolve { ref host } if host == "cards.example"));
    }

    #[test]
    fn refused_start_fails_without_waiting() {
        let stack = SimStack::spawn(Script {
            dns: DnsBehavior::StartError(StackError::Arg),
            ..Script::default()
        });
        let err = resolve(&stack, "", Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, FetchError::ResolveStart { source: StackError::Arg, .. }));
    }
}
