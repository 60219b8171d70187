use crate::session::{SessionInfo, StreamId, StreamSession, Termination};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Active sessions by id, plus a bounded log of how recent sessions ended.
///
/// Every method takes the lock for a single map operation and never performs I/O while holding it.
pub struct Registry {
    sessions: Mutex<HashMap<StreamId, StreamSession>>,
    outcomes: Mutex<VecDeque<Termination>>,
    outcome_log_size: usize,
}

impl Registry {
    pub fn new(outcome_log_size: usize) -> Registry {
        Registry {
            sessions: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(VecDeque::with_capacity(outcome_log_size)),
            outcome_log_size,
        }
    }

    /// Insert a session; on an id collision the session is handed back untouched.
    pub(crate) fn put(&self, session: StreamSession) -> Result<(), StreamSession> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.id) {
            return Err(session);
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn get(&self, id: &StreamId) -> Option<SessionInfo> {
        self.sessions.lock().get(id).map(|session| session.info())
    }

    /// Take a session out of the registry. At most one caller ever gets `Some` for a given
    /// registration, which is what makes cleanup run exactly once.
    pub(crate) fn remove(&self, id: &StreamId) -> Option<StreamSession> {
        self.sessions.lock().remove(id)
    }

    pub(crate) fn drain(&self) -> Vec<StreamSession> {
        self.sessions.lock().drain().map(|(_, session)| session).collect()
    }

    pub fn contains(&self, id: &StreamId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn list(&self) -> Vec<StreamId> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn infos(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .lock()
            .values()
            .map(|session| session.info())
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn record(&self, termination: Termination) {
        if self.outcome_log_size == 0 {
            return;
        }
        let mut outcomes = self.outcomes.lock();
        while outcomes.len() >= self.outcome_log_size {
            outcomes.pop_front();
        }
        outcomes.push_back(termination);
    }

    /// Terminal state of a reclaimed session, if it is still remembered
    pub fn outcome(&self, id: &StreamId) -> Option<Termination> {
        self.outcomes
            .lock()
            .iter()
            .rev()
            .find(|termination| &termination.id == id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ExitReason, ProcessControl};
    use tokio::sync::oneshot;

    fn session(id: &StreamId) -> StreamSession {
        let (terminate, _terminate_rx) = oneshot::channel();
        let (_report_tx, report) = oneshot::channel();
        StreamSession {
            id: id.clone(),
            source_url: "rtsp://camera.local/live".to_string(),
            started_at: chrono::Utc::now(),
            output_dir: std::path::PathBuf::from("/tmp").join(id.as_str()),
            pid: None,
            control: ProcessControl { terminate, report },
        }
    }

    #[test]
    fn test_put_get_remove() {
        let registry = Registry::new(4);
        let id = StreamId::random();
        assert!(registry.put(session(&id)).is_ok());
        assert!(registry.contains(&id));
        assert_eq!(registry.get(&id).unwrap().source_url, "rtsp://camera.local/live");
        assert_eq!(registry.list(), vec![id.clone()]);

        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.id(), &id);
        assert!(registry.remove(&id).is_none());
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_put_rejects_duplicate_id() {
        let registry = Registry::new(4);
        let id = StreamId::random();
        registry.put(session(&id)).unwrap();
        let rejected = registry.put(session(&id)).unwrap_err();
        assert_eq!(rejected.id(), &id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_remove_is_exactly_once() {
        let registry = std::sync::Arc::new(Registry::new(4));
        let id = StreamId::random();
        registry.put(session(&id)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || registry.remove(&id).is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_outcome_log_is_bounded() {
        let registry = Registry::new(2);
        let ids: Vec<StreamId> = (0..3).map(|_| StreamId::random()).collect();
        for id in &ids {
            registry.record(Termination::new(
                id.clone(),
                ExitReason::ExitedNaturally,
                None,
                vec![],
            ));
        }
        assert!(registry.outcome(&ids[0]).is_none());
        assert_eq!(
            registry.outcome(&ids[2]).unwrap().reason,
            ExitReason::ExitedNaturally
        );
    }
}
