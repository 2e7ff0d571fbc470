use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use zpm_core::types::StateRecord;

/// Change notification carrying an owned copy of the record, never a
/// reference into the store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
	Updated(StateRecord),
	Removed(String),
}

/// In-memory registry of per-worker state records. Keyed by worker name,
/// last writer wins. Observers subscribe to a broadcast channel; a slow
/// observer lags, it never blocks a writer.
#[derive(Clone)]
pub struct ProcessStore {
	records: Arc<RwLock<HashMap<String, StateRecord>>>,
	events: broadcast::Sender<StoreEvent>,
}

impl Default for ProcessStore {
	fn default() -> Self {
		Self::new()
	}
}

impl ProcessStore {
	pub fn new() -> Self {
		let (events, _) = broadcast::channel(256);
		Self {
			records: Arc::new(RwLock::new(HashMap::new())),
			events,
		}
	}

	pub fn put(&self, record: StateRecord) {
		self.records
			.write()
			.expect("store lock poisoned")
			.insert(record.name.clone(), record.clone());
		let _ = self.events.send(StoreEvent::Updated(record));
	}

	pub fn remove(&self, name: &str) {
		let removed = self
			.records
			.write()
			.expect("store lock poisoned")
			.remove(name)
			.is_some();
		if removed {
			let _ = self.events.send(StoreEvent::Removed(name.to_string()));
		}
	}

	pub fn get(&self, name: &str) -> Option<StateRecord> {
		self.records.read().expect("store lock poisoned").get(name).cloned()
	}

	pub fn all(&self) -> Vec<StateRecord> {
		let mut records: Vec<StateRecord> = self
			.records
			.read()
			.expect("store lock poisoned")
			.values()
			.cloned()
			.collect();
		records.sort_by(|a, b| a.name.cmp(&b.name));
		records
	}

	pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
		self.events.subscribe()
	}
}
