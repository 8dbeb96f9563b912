//! Live request table kept by the monitor.

use std::{cell::OnceCell, collections::HashMap};

use super::render::truncate_method_path;
use crate::protocol::{Event, Record, RequestId};

/// Longest client address shown, longer ones are cut.
pub const CLIENT_IP_WIDTH: usize = 15;

/// Lifecycle stage of a request as seen by the monitor.
///
/// Stages only move forward, a late `sent` after progress was reported keeps `Stream`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display,
)]
pub enum RequestState {
    Connect,
    Sent,
    Stream,
    Done,
}

/// A request that is currently shown.
#[derive(Debug, Clone)]
pub struct OngoingRequest {
    pub id: RequestId,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub state: RequestState,
    pub bytes_so_far: u64,
    pub bytes_expected: u64,
    method_path: OnceCell<String>,
}

impl OngoingRequest {
    fn new(id: RequestId, client_ip: &str, method: String, path: String) -> Self {
        Self {
            id,
            client_ip: client_ip.chars().take(CLIENT_IP_WIDTH).collect(),
            method,
            path,
            state: RequestState::Connect,
            bytes_so_far: 0,
            bytes_expected: 0,
            method_path: OnceCell::new(),
        }
    }

    /// Method and path, shortened and padded to the table column. Computed once.
    pub fn method_path(&self) -> &str {
        self.method_path
            .get_or_init(|| truncate_method_path(&format!("{} {}", self.method, self.path)))
    }

    fn advance(&mut self, state: RequestState) {
        self.state = self.state.max(state);
    }

    fn update(&mut self, event: Event) -> Applied {
        match event {
            Event::Sent => self.advance(RequestState::Sent),
            Event::Length(expected) => {
                self.advance(RequestState::Stream);
                self.bytes_expected = expected;
            }
            Event::Progress(delta) => {
                self.advance(RequestState::Stream);
                self.bytes_so_far = self.bytes_so_far.saturating_add(delta);
            }
            Event::End => {
                self.advance(RequestState::Done);
                return Applied::Ended(self.id);
            }
            Event::New { .. } | Event::Remove => return Applied::Ignored,
        }
        Applied::Changed
    }
}

/// What applying a record did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The table changed.
    Changed,
    /// The request reached [`RequestState::Done`] and should be removed later.
    Ended(RequestId),
    /// The record referred to an unknown request.
    Ignored,
}

/// Requests in arrival order, indexed by id.
#[derive(Debug, Default)]
pub struct RequestTable {
    by_id: HashMap<RequestId, OngoingRequest>,
    order: Vec<RequestId>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: RequestId) -> Option<&OngoingRequest> {
        self.by_id.get(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Iterates over the live requests in the order they arrived.
    pub fn iter(&self) -> impl Iterator<Item = &OngoingRequest> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Applies one record.
    pub fn apply(&mut self, record: Record) -> Applied {
        let Record { id, event } = record;
        match event {
            Event::New {
                client_ip,
                method,
                path,
            } => {
                self.remove(id);
                self.by_id
                    .insert(id, OngoingRequest::new(id, &client_ip, method, path));
                self.order.push(id);
                Applied::Changed
            }
            Event::Remove => match self.remove(id) {
                true => Applied::Changed,
                false => Applied::Ignored,
            },
            event => match self.by_id.get_mut(&id) {
                Some(request) => request.update(event),
                None => Applied::Ignored,
            },
        }
    }

    fn remove(&mut self, id: RequestId) -> bool {
        if self.by_id.remove(&id).is_none() {
            return false;
        }
        self.order.retain(|other| *other != id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(line: &str) -> Record {
        line.parse().unwrap()
    }

    #[test]
    fn lifecycle_reaches_done() {
        let mut table = RequestTable::new();
        for line in [
            "1 new 10.0.0.1 GET /file",
            "1 sent",
            "1 length 1000",
            "1 progress 400",
            "1 progress 600",
        ] {
            assert_eq!(table.apply(record(line)), Applied::Changed);
        }
        assert_eq!(table.apply(record("1 end")), Applied::Ended(RequestId(1)));
        let request = table.get(RequestId(1)).unwrap();
        assert_eq!(request.state, RequestState::Done);
        assert_eq!((request.bytes_so_far, request.bytes_expected), (1000, 1000));

        assert_eq!(table.apply(record("1 remove")), Applied::Changed);
        assert!(table.is_empty());
        assert_eq!(table.apply(record("1 remove")), Applied::Ignored);
    }

    #[test]
    fn duplicate_new_keeps_one_entry() {
        let mut table = RequestTable::new();
        table.apply(record("7 new 10.0.0.1 GET /a"));
        table.apply(record("8 new 10.0.0.2 GET /b"));
        table.apply(record("7 progress 5"));
        table.apply(record("7 new 10.0.0.3 POST /c"));
        assert_eq!(table.len(), 2);
        let ids: Vec<_> = table.iter().map(|r| r.id).collect();
        assert_eq!(ids, [RequestId(8), RequestId(7)]);
        let fresh = table.get(RequestId(7)).unwrap();
        assert_eq!(fresh.state, RequestState::Connect);
        assert_eq!(fresh.bytes_so_far, 0);
        assert_eq!(fresh.method, "POST");
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut table = RequestTable::new();
        for line in ["3 sent", "3 length 10", "3 progress 1", "3 end", "3 remove"] {
            assert_eq!(table.apply(record(line)), Applied::Ignored);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn client_ip_is_truncated() {
        let mut table = RequestTable::new();
        table.apply(record("1 new 2001:db8:85a3::8a2e:370:7334 GET /"));
        assert_eq!(table.get(RequestId(1)).unwrap().client_ip, "2001:db8:85a3::");
    }

    #[test]
    fn state_never_goes_back() {
        let mut table = RequestTable::new();
        table.apply(record("1 new 10.0.0.1 GET /"));
        table.apply(record("1 progress 3"));
        table.apply(record("1 sent"));
        assert_eq!(table.get(RequestId(1)).unwrap().state, RequestState::Stream);
    }

    #[test]
    fn state_labels() {
        let labels: Vec<_> = [
            RequestState::Connect,
            RequestState::Sent,
            RequestState::Stream,
            RequestState::Done,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(labels, ["Connect", "Sent", "Stream", "Done"]);
    }
}
