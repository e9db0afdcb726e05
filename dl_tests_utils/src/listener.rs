use dlengine_api::engine::{DownloadListener, EventKind, TransferInfo};
use std::sync::Mutex;

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub gid: String,
    pub info: TransferInfo,
}

/// Listener that records every event it receives, in delivery order.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<RecordedEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds_for(&self, gid: &str) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.gid == gid)
            .map(|event| event.kind)
            .collect()
    }

    fn record(&self, kind: EventKind, gid: &str, info: &TransferInfo) {
        self.events.lock().unwrap().push(RecordedEvent {
            kind,
            gid: gid.to_string(),
            info: info.clone(),
        });
    }
}

impl DownloadListener for EventLog {
    fn on_download_start(&self, gid: &str, info: &TransferInfo) {
        self.record(EventKind::Start, gid, info);
    }

    fn on_download_progress(&self, gid: &str, info: &TransferInfo) {
        self.record(EventKind::Progress, gid, info);
    }

    fn on_download_complete(&self, gid: &str, info: &TransferInfo) {
        self.record(EventKind::Complete, gid, info);
    }

    fn on_download_stop(&self, gid: &str, info: &TransferInfo) {
        self.record(EventKind::Stop, gid, info);
    }
}
