//! Scan session state machine.
//!
//! [`ScanSession`] owns the aggregation store and the projection and turns
//! user operations, observations, errors and timeouts into one
//! [`ScanSessionState`]. It is synchronous and takes the current time as an
//! argument, which keeps it independent of any runtime. The asynchronous
//! plumbing (platform subscription, timer, observers) lives in
//! [`crate::controller`].
//!
//! ```text
//! Idle --start--> Scanning --ingest--> Result / Empty
//!                    |                      |
//!                    +--- error ------------+--> Error --retry--> Scanning
//!                    +--- timeout / stop ---+--> (frozen Result / Empty)
//! any --reload--> Scanning (store cleared)
//! ```

use crate::filter::FilterCriteria;
use crate::observation::Observation;
use crate::projection::Projection;
use crate::store::{AggregationStore, ScannedPeripheral};
use log::{debug, info, warn};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a session ended up in [`ScanSessionState::Error`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorCause {
    #[error("Bluetooth is disabled")]
    BluetoothDisabled,
    #[error("Bluetooth permission denied")]
    PermissionDenied,
    #[error("Location services are disabled")]
    LocationDisabled,
    #[error("Platform error: {0}")]
    Platform(String),
}

/// The externally visible state of a scan session.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanSessionState {
    /// Nothing started yet
    Idle,
    /// Scanning, nothing ingested yet
    Scanning { since: Instant },
    /// Peripherals matching the current criteria, in first-seen order
    Result(Vec<ScannedPeripheral>),
    /// Observations ingested, none matching
    Empty,
    Error(ErrorCause),
}

impl ScanSessionState {
    /// Listed peripherals; empty for every state but `Result`.
    pub fn peripherals(&self) -> &[ScannedPeripheral] {
        match self {
            ScanSessionState::Result(peripherals) => peripherals,
            _ => &[],
        }
    }

    pub fn error(&self) -> Option<&ErrorCause> {
        match self {
            ScanSessionState::Error(cause) => Some(cause),
            _ => None,
        }
    }
}

/// The value published to observers: the state plus whether a platform
/// scan is running. A `Result` with `is_scanning == false` is a frozen
/// result after a timeout or stop.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ScanSessionState,
    pub is_scanning: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionSnapshot {
            state: ScanSessionState::Idle,
            is_scanning: false,
        }
    }
}

/// Lifecycle-agnostic scan session.
#[derive(Debug)]
pub struct ScanSession {
    store: AggregationStore,
    projection: Projection,
    state: ScanSessionState,
    scanning: bool,
    /// Timeout of the last start, reused by reload and retry
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    /// Bumped whenever a new scan begins
    generation: u64,
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanSession {
    pub fn new() -> Self {
        ScanSession {
            store: AggregationStore::new(),
            projection: Projection::new(FilterCriteria::all()),
            state: ScanSessionState::Idle,
            scanning: false,
            timeout: None,
            deadline: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> &ScanSessionState {
        &self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            is_scanning: self.scanning,
        }
    }

    pub fn criteria(&self) -> &FilterCriteria {
        self.projection.criteria()
    }

    pub fn store(&self) -> &AggregationStore {
        &self.store
    }

    /// When the running scan times out, if it has a timeout.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Identifies the running scan; changes on every start, reload and retry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new scan with `criteria`, stopping after `timeout` if given.
    ///
    /// Ignored while a scan is running and in the error state (use
    /// [`retry`](Self::retry)). Starting from a frozen result begins a new
    /// session. Returns whether a scan is now running; a zero timeout
    /// expires immediately and leaves the session `Empty`.
    pub fn start(
        &mut self,
        criteria: FilterCriteria,
        timeout: Option<Duration>,
        now: Instant,
    ) -> bool {
        if self.scanning {
            debug!("start ignored: already scanning");
            return false;
        }
        if let ScanSessionState::Error(cause) = &self.state {
            debug!("start ignored: session failed ({cause}), retry required");
            return false;
        }

        self.projection = Projection::new(criteria);
        self.timeout = timeout;
        self.begin(now)
    }

    fn begin(&mut self, now: Instant) -> bool {
        self.store.clear();
        self.projection.rebuild(&self.store);
        self.generation += 1;

        match self.timeout {
            Some(timeout) if timeout.is_zero() => {
                info!("scan timeout already elapsed, not scanning");
                self.scanning = false;
                self.deadline = None;
                self.state = ScanSessionState::Empty;
            }
            timeout => {
                info!("scan started (timeout: {timeout:?})");
                self.scanning = true;
                // An unrepresentable deadline is as good as none.
                self.deadline = timeout.and_then(|timeout| now.checked_add(timeout));
                self.state = ScanSessionState::Scanning { since: now };
            }
        }
        self.scanning
    }

    /// Merge one observation. Rejected unless a scan is running and its
    /// deadline has not passed; a passed deadline freezes the session first.
    pub fn ingest(&mut self, observation: Observation, now: Instant) -> bool {
        if !self.scanning {
            debug!("observation from {} ignored: not scanning", observation.id);
            return false;
        }
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            self.time_out();
            return false;
        }

        let change = self.store.ingest(observation);
        self.projection.apply(change, &self.store);
        self.refresh_result();
        true
    }

    fn refresh_result(&mut self) {
        self.state = if self.projection.is_empty() {
            ScanSessionState::Empty
        } else {
            ScanSessionState::Result(self.projection.collect(&self.store))
        };
    }

    /// The platform reported that scanning can no longer continue.
    /// Only a running scan can fail.
    pub fn fail(&mut self, cause: ErrorCause) -> bool {
        if !self.scanning {
            debug!("error ignored: not scanning ({cause})");
            return false;
        }
        warn!("scan failed: {cause}");
        self.scanning = false;
        self.deadline = None;
        self.state = ScanSessionState::Error(cause);
        true
    }

    /// The timeout elapsed: stop scanning, keep the last result.
    pub fn time_out(&mut self) -> bool {
        if !self.scanning {
            return false;
        }
        info!("scan timed out with {} matching peripherals", self.projection.len());
        self.freeze();
        true
    }

    /// Stop scanning, keep the last result.
    pub fn stop(&mut self) -> bool {
        if !self.scanning {
            debug!("stop ignored: not scanning");
            return false;
        }
        info!("scan stopped with {} matching peripherals", self.projection.len());
        self.freeze();
        true
    }

    fn freeze(&mut self) {
        self.scanning = false;
        self.deadline = None;
        if let ScanSessionState::Scanning { .. } = self.state {
            self.state = ScanSessionState::Empty;
        }
    }

    /// Clear the store and scan again, from any state, with the current
    /// criteria and the last timeout.
    pub fn reload(&mut self, now: Instant) -> bool {
        info!("reloading scan");
        self.begin(now)
    }

    /// Leave the error state and scan again. Ignored in other states.
    pub fn retry(&mut self, now: Instant) -> bool {
        let ScanSessionState::Error(cause) = &self.state else {
            debug!("retry ignored: session has not failed");
            return false;
        };
        info!("retrying after: {cause}");
        self.state = ScanSessionState::Idle;
        self.begin(now)
    }

    /// Replace the filter criteria. Live and frozen results are projected
    /// again; other states only keep the new criteria. Returns whether the
    /// state changed.
    pub fn update_criteria(&mut self, criteria: FilterCriteria) -> bool {
        if !self.projection.set_criteria(criteria, &self.store) {
            return false;
        }
        match self.state {
            ScanSessionState::Result(_) | ScanSessionState::Empty => {
                let before = self.state.clone();
                self.refresh_result();
                before != self.state
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{named_observation, unnamed_observation};

    const A: &str = "AA:00:00:00:00:0A";
    const B: &str = "AA:00:00:00:00:0B";

    fn ids(state: &ScanSessionState) -> Vec<&str> {
        state.peripherals().iter().map(|p| p.id().as_str()).collect()
    }

    fn started(criteria: FilterCriteria, timeout: Option<Duration>) -> (ScanSession, Instant) {
        let now = Instant::now();
        let mut session = ScanSession::new();
        assert!(session.start(criteria, timeout, now));
        (session, now)
    }

    #[test]
    fn test_initial_state_is_idle() {
        let session = ScanSession::new();
        assert_eq!(session.snapshot(), SessionSnapshot::default());
        assert!(session.criteria().is_unconstrained());
    }

    #[test]
    fn test_start_enters_scanning() {
        let (session, now) = started(FilterCriteria::all(), None);
        assert_eq!(session.state(), &ScanSessionState::Scanning { since: now });
        assert!(session.is_scanning());
        assert_eq!(session.deadline(), None);
    }

    #[test]
    fn test_first_matching_observation_yields_result() {
        let (mut session, now) = started(FilterCriteria::all(), None);
        assert!(session.ingest(named_observation(A, -60, "Thingy"), now));
        assert_eq!(ids(session.state()), [A]);
    }

    #[test]
    fn test_non_matching_observations_yield_empty() {
        let (mut session, now) = started(FilterCriteria::all().only_with_name(), None);
        assert!(session.ingest(unnamed_observation(A, -60), now));
        assert_eq!(session.state(), &ScanSessionState::Empty);
        assert!(session.is_scanning());
        assert_eq!(session.store().len(), 1);
    }

    #[test]
    fn test_resighting_scenario() {
        let (mut session, now) = started(FilterCriteria::all().with_min_rssi(-70), None);
        session.ingest(unnamed_observation(A, -60), now);
        session.ingest(unnamed_observation(B, -90), now);
        session.ingest(unnamed_observation(A, -55), now);

        let peripherals = session.state().peripherals();
        assert_eq!(ids(session.state()), [A]);
        assert_eq!(peripherals[0].rssi(), -55);
    }

    #[test]
    fn test_zero_timeout_goes_straight_to_empty() {
        let now = Instant::now();
        let mut session = ScanSession::new();
        assert!(!session.start(FilterCriteria::all(), Some(Duration::ZERO), now));
        assert_eq!(session.state(), &ScanSessionState::Empty);
        assert!(!session.is_scanning());

        assert!(!session.ingest(unnamed_observation(A, -60), now));
        assert!(session.store().is_empty());
        assert_eq!(session.state(), &ScanSessionState::Empty);
    }

    #[test]
    fn test_error_in_result_state_blocks_ingestion_until_retry() {
        let (mut session, now) = started(FilterCriteria::all(), None);
        session.ingest(unnamed_observation(A, -60), now);
        session.ingest(unnamed_observation(B, -60), now);
        assert_eq!(session.state().peripherals().len(), 2);

        assert!(session.fail(ErrorCause::BluetoothDisabled));
        assert_eq!(
            session.state(),
            &ScanSessionState::Error(ErrorCause::BluetoothDisabled)
        );
        assert!(!session.is_scanning());
        assert!(!session.ingest(unnamed_observation(A, -50), now));

        // start is not a way out of an error
        assert!(!session.start(FilterCriteria::all(), None, now));
        assert!(session.state().error().is_some());

        let later = now + Duration::from_secs(1);
        assert!(session.retry(later));
        assert_eq!(session.state(), &ScanSessionState::Scanning { since: later });
        assert!(session.store().is_empty());
        assert!(session.ingest(unnamed_observation(B, -60), later));
        assert_eq!(ids(session.state()), [B]);
    }

    #[test]
    fn test_timeout_freezes_last_result() {
        let (mut session, now) = started(FilterCriteria::all(), Some(Duration::from_secs(10)));
        assert_eq!(session.deadline(), Some(now + Duration::from_secs(10)));
        session.ingest(unnamed_observation(A, -60), now + Duration::from_secs(1));

        assert!(session.time_out());
        assert!(!session.is_scanning());
        assert_eq!(ids(session.state()), [A]);
        assert!(!session.ingest(unnamed_observation(B, -60), now + Duration::from_secs(2)));
        assert_eq!(ids(session.state()), [A]);
    }

    #[test]
    fn test_timeout_without_observations_is_empty() {
        let (mut session, _) = started(FilterCriteria::all(), Some(Duration::from_secs(5)));
        assert!(session.time_out());
        assert_eq!(session.state(), &ScanSessionState::Empty);
        assert!(session.state().error().is_none());
    }

    #[test]
    fn test_ingest_after_deadline_is_rejected_before_timer_fires() {
        let (mut session, now) = started(FilterCriteria::all(), Some(Duration::from_secs(5)));
        session.ingest(unnamed_observation(A, -60), now);

        assert!(!session.ingest(unnamed_observation(B, -60), now + Duration::from_secs(5)));
        assert!(!session.is_scanning());
        assert_eq!(ids(session.state()), [A]);
    }

    #[test]
    fn test_stop_freezes_like_timeout() {
        let (mut session, now) = started(FilterCriteria::all(), None);
        session.ingest(unnamed_observation(A, -60), now);
        assert!(session.stop());
        assert!(!session.stop());
        assert_eq!(ids(session.state()), [A]);
        assert!(!session.is_scanning());
    }

    #[test]
    fn test_reload_clears_store_from_any_state() {
        let (mut session, now) = started(FilterCriteria::all().with_name("x"), None);
        session.ingest(named_observation(A, -60, "x"), now);
        let generation = session.generation();

        assert!(session.reload(now));
        assert_eq!(session.state(), &ScanSessionState::Scanning { since: now });
        assert!(session.store().is_empty());
        assert_eq!(session.criteria(), &FilterCriteria::all().with_name("x"));
        assert_ne!(session.generation(), generation);

        session.fail(ErrorCause::PermissionDenied);
        assert!(session.reload(now));
        assert!(session.is_scanning());
    }

    #[test]
    fn test_reload_reuses_timeout() {
        let (mut session, now) = started(FilterCriteria::all(), Some(Duration::from_secs(3)));
        session.time_out();

        let later = now + Duration::from_secs(60);
        assert!(session.reload(later));
        assert_eq!(session.deadline(), Some(later + Duration::from_secs(3)));
    }

    #[test]
    fn test_start_while_scanning_is_ignored() {
        let (mut session, now) = started(FilterCriteria::all(), None);
        session.ingest(unnamed_observation(A, -60), now);
        let generation = session.generation();

        assert!(!session.start(FilterCriteria::all().nearby_only(), None, now));
        assert_eq!(session.generation(), generation);
        assert_eq!(ids(session.state()), [A]);
        assert!(session.criteria().is_unconstrained());
    }

    #[test]
    fn test_start_after_stop_begins_new_session() {
        let (mut session, now) = started(FilterCriteria::all(), None);
        session.ingest(unnamed_observation(A, -60), now);
        session.stop();

        assert!(session.start(FilterCriteria::all(), None, now));
        assert!(session.store().is_empty());
    }

    #[test]
    fn test_update_criteria_reprojects_and_restores() {
        let (mut session, now) = started(FilterCriteria::all(), None);
        session.ingest(named_observation(A, -60, "Nordic HRM"), now);
        session.ingest(named_observation(B, -80, "Thingy"), now);
        let original = session.state().clone();

        assert!(session.update_criteria(FilterCriteria::all().with_min_rssi(-70)));
        assert_eq!(ids(session.state()), [A]);

        assert!(session.update_criteria(FilterCriteria::all().with_name("zzz")));
        assert_eq!(session.state(), &ScanSessionState::Empty);

        assert!(session.update_criteria(FilterCriteria::all()));
        assert_eq!(session.state(), &original);
        assert!(!session.update_criteria(FilterCriteria::all()));
        assert_eq!(session.store().len(), 2);
    }

    #[test]
    fn test_update_criteria_applies_to_frozen_result() {
        let (mut session, now) = started(FilterCriteria::all(), None);
        session.ingest(unnamed_observation(A, -60), now);
        session.ingest(unnamed_observation(B, -80), now);
        session.stop();

        session.update_criteria(FilterCriteria::all().with_min_rssi(-70));
        assert_eq!(ids(session.state()), [A]);
        assert!(!session.is_scanning());
    }

    #[test]
    fn test_update_criteria_while_waiting_keeps_scanning_state() {
        let (mut session, now) = started(FilterCriteria::all(), None);
        assert!(!session.update_criteria(FilterCriteria::all().nearby_only()));
        assert_eq!(session.state(), &ScanSessionState::Scanning { since: now });

        session.ingest(unnamed_observation(A, -70), now);
        assert_eq!(session.state(), &ScanSessionState::Empty);
    }

    #[test]
    fn test_errors_and_retries_outside_their_states_are_ignored() {
        let mut session = ScanSession::new();
        assert!(!session.fail(ErrorCause::BluetoothDisabled));
        assert!(!session.retry(Instant::now()));
        assert!(!session.time_out());
        assert_eq!(session.state(), &ScanSessionState::Idle);
    }

    #[test]
    fn test_error_cause_display() {
        assert_eq!(ErrorCause::BluetoothDisabled.to_string(), "Bluetooth is disabled");
        assert_eq!(
            ErrorCause::Platform("Internal error".into()).to_string(),
            "Platform error: Internal error"
        );
    }
}
