//! Capability bridges between the engine and the host.
//!
//! A bridge is a synchronous function installed under a well-known
//! process-wide slot for the duration of one `exec` call; the engine reaches
//! host capabilities (network, timers, nested runtimes, custom commands)
//! through these slots and nothing else. Installation is scoped: the guard
//! returned by [`install`] restores the previous slot contents when dropped,
//! even when the call unwinds, so sessions sharing a process cannot corrupt
//! each other's bridges permanently.
//!
//! Every bridge is total: host failures and malformed payloads become an
//! `error` field inside a well-formed response, never a panic across the
//! engine boundary.

use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

mod custom;
mod fetch;
mod timers;
mod vm;

pub use custom::{CustomRequest, CustomResponse};
pub use fetch::{FetchRequest, FetchResponse, Fetcher, HttpFetcher};
pub use timers::Sleeper;
pub use vm::{VmHandler, VmRequest, VmResponse};

pub(crate) use custom::make_custom_bridge;
pub(crate) use fetch::make_fetch_bridge;
pub(crate) use timers::{Clock, make_now_bridge, make_sleep_bridge};
pub(crate) use vm::encode as vm_encode;

/// A JSON-in/JSON-out bridge function.
pub type JsonBridge = Arc<dyn Fn(&str) -> String + Send + Sync>;
/// The sleep bridge: duration in milliseconds, empty string or error out.
pub type SleepBridge = Arc<dyn Fn(u64) -> String + Send + Sync>;
/// The clock bridge: monotonic milliseconds in a positive 31-bit range.
pub type NowBridge = Arc<dyn Fn() -> i64 + Send + Sync>;

/// The full set of bridges installed for one engine call.
///
/// Absent slots mean the capability is not configured: the engine observes
/// the absence (e.g. no network) rather than an error.
#[derive(Clone, Default)]
pub struct BridgeSet {
    /// Network fetch, present only when networking is configured.
    pub fetch: Option<JsonBridge>,
    /// Sleep, always present during a call.
    pub sleep: Option<SleepBridge>,
    /// Monotonic clock, always present during a call.
    pub now: Option<NowBridge>,
    /// Nested-runtime dispatch, present when any runtime is configured.
    pub vm: Option<JsonBridge>,
    /// Custom-command dispatch, present when commands are registered.
    pub custom: Option<JsonBridge>,
}

impl fmt::Debug for BridgeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSet")
            .field("fetch", &self.fetch.is_some())
            .field("sleep", &self.sleep.is_some())
            .field("now", &self.now.is_some())
            .field("vm", &self.vm.is_some())
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

static SLOTS: LazyLock<Mutex<BridgeSet>> = LazyLock::new(|| Mutex::new(BridgeSet::default()));

fn slots() -> std::sync::MutexGuard<'static, BridgeSet> {
    SLOTS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install a bridge set, returning a guard that restores the previous set
/// when dropped.
#[must_use = "dropping the guard immediately uninstalls the bridges"]
pub fn install(set: BridgeSet) -> SlotGuard {
    let previous = std::mem::replace(&mut *slots(), set);
    SlotGuard {
        previous: Some(previous),
    }
}

/// Restores the previously-installed bridge set on drop.
#[derive(Debug)]
pub struct SlotGuard {
    previous: Option<BridgeSet>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *slots() = previous;
        }
    }
}

/// Invoke the installed fetch bridge, if any.
pub fn fetch(request_json: &str) -> Option<String> {
    let bridge = slots().fetch.clone();
    bridge.map(|bridge| bridge(request_json))
}

/// Invoke the installed sleep bridge, if any.
pub fn sleep(duration_ms: u64) -> Option<String> {
    let bridge = slots().sleep.clone();
    bridge.map(|bridge| bridge(duration_ms))
}

/// Invoke the installed clock bridge, if any.
pub fn now() -> Option<i64> {
    let bridge = slots().now.clone();
    bridge.map(|bridge| bridge())
}

/// Invoke the installed nested-runtime bridge, if any.
pub fn vm(request_json: &str) -> Option<String> {
    let bridge = slots().vm.clone();
    bridge.map(|bridge| bridge(request_json))
}

/// Invoke the installed custom-command bridge, if any.
pub fn custom(request_json: &str) -> Option<String> {
    let bridge = slots().custom.clone();
    bridge.map(|bridge| bridge(request_json))
}
