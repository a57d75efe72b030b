//! The set of live sessions and the timer sweep over them.
//!
//! [`Registry`] is owned by whoever drives the event loop; there is no
//! process-wide list.  Sessions live in a [`Slab`] and are threaded onto an
//! intrusive doubly linked list through slab indices, so insertion at the
//! front and removal by handle are O(1) and traversal needs no allocation.
//!
//! Handles are slab indices: once a session is destroyed its [`SessionId`]
//! may be reused by a later session, so callers must drop handles when
//! [`Registry::receive`] reports [`Status::Finished`].

use std::io;
use std::time::Instant;

use slab::Slab;
use thiserror::Error;

use crate::config::Config;
use crate::connection::Connection;
use crate::session::Session;
use crate::state::Status;

/// Handle to a session held by a [`Registry`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId(usize);

impl From<SessionId> for usize {
    fn from(x: SessionId) -> usize {
        x.0
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The underlying connection could not be established.
    #[error("failed to create connection: {0}")]
    Connect(#[source] io::Error),
    /// The handle does not name a live session.
    #[error("no live session {0:?}")]
    UnknownSession(SessionId),
}

#[derive(Debug)]
struct Node<C> {
    session: Session<C>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Live sessions, most recently created first.
#[derive(Debug)]
pub struct Registry<C> {
    nodes: Slab<Node<C>>,
    head: Option<usize>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            nodes: Slab::new(),
            head: None,
        }
    }
}

impl<C: Connection> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session over an already established connection.
    pub fn insert(&mut self, conn: C, config: &Config) -> SessionId {
        let index = self.nodes.insert(Node {
            session: Session::new(conn, config),
            prev: None,
            next: self.head,
        });
        if let Some(old_head) = self.head {
            self.nodes[old_head].prev = Some(index);
        }
        self.head = Some(index);
        log::debug!("[rel] session {index} registered ({} live)", self.nodes.len());
        SessionId(index)
    }

    /// Establish a fresh connection with `connector` and register a session
    /// over it.  Nothing is registered if the connector fails.
    pub fn connect<F>(&mut self, config: &Config, connector: F) -> Result<SessionId, SessionError>
    where
        F: FnOnce() -> io::Result<C>,
    {
        let conn = connector().map_err(SessionError::Connect)?;
        Ok(self.insert(conn, config))
    }

    /// Deliver a datagram to session `id`, destroying the session if that
    /// finishes it.
    pub fn receive(
        &mut self,
        id: SessionId,
        buf: &[u8],
        n: usize,
        now: Instant,
    ) -> Result<Status, SessionError> {
        let status = self.get_mut(id)?.receive(buf, n, now);
        if status == Status::Finished {
            self.destroy(id);
        }
        Ok(status)
    }

    /// Let session `id` pull and send whatever application data is ready.
    pub fn read(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        self.get_mut(id)?.read(now);
        Ok(())
    }

    /// The timer sweep: retransmit every expired packet of every session.
    ///
    /// Returns the total number of retransmissions.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut resent = 0;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let node = &mut self.nodes[index];
            resent += node.session.retransmit_expired(now);
            cursor = node.next;
        }
        resent
    }

    pub fn get(&self, id: SessionId) -> Result<&Session<C>, SessionError> {
        self.nodes
            .get(id.0)
            .map(|node| &node.session)
            .ok_or(SessionError::UnknownSession(id))
    }

    pub fn get_mut(&mut self, id: SessionId) -> Result<&mut Session<C>, SessionError> {
        self.nodes
            .get_mut(id.0)
            .map(|node| &mut node.session)
            .ok_or(SessionError::UnknownSession(id))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.nodes.contains(id.0)
    }

    /// Live sessions from most to least recently registered.
    pub fn iter(&self) -> Iter<'_, C> {
        Iter {
            nodes: &self.nodes,
            cursor: self.head,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn destroy(&mut self, id: SessionId) {
        if let Some(session) = self.unlink(id) {
            session.destroy();
            log::debug!("[rel] session {} destroyed ({} live)", id.0, self.nodes.len());
        }
    }

    /// Detach session `id` from the list and the slab.
    fn unlink(&mut self, id: SessionId) -> Option<Session<C>> {
        if !self.nodes.contains(id.0) {
            return None;
        }
        let node = self.nodes.remove(id.0);
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        if let Some(next) = node.next {
            self.nodes[next].prev = node.prev;
        }
        Some(node.session)
    }
}

/// Forward traversal over a [`Registry`].
pub struct Iter<'a, C> {
    nodes: &'a Slab<Node<C>>,
    cursor: Option<usize>,
}

impl<'a, C> Iterator for Iter<'a, C> {
    type Item = (SessionId, &'a Session<C>);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = &self.nodes[index];
        self.cursor = node.next;
        Some((SessionId(index), &node.session))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;
    use crate::connection::Input;
    use crate::packet::{encode_ack, encode_data};

    #[derive(Debug, Default)]
    struct Log {
        input: Vec<u8>,
        eof: bool,
        sent: Vec<Vec<u8>>,
        destroyed: usize,
    }

    /// Connection whose effects stay observable after the session is gone.
    #[derive(Debug, Clone, Default)]
    struct Shared(Rc<RefCell<Log>>);

    impl Connection for Shared {
        fn input(&mut self, buf: &mut [u8]) -> Input {
            let mut log = self.0.borrow_mut();
            if log.input.is_empty() {
                return if log.eof { Input::Eof } else { Input::Empty };
            }
            let n = buf.len().min(log.input.len());
            buf[..n].copy_from_slice(&log.input[..n]);
            log.input.drain(..n);
            Input::Data(n)
        }

        fn output(&mut self, _data: &[u8]) {}

        fn output_eof(&mut self) {}

        fn send_packet(&mut self, packet: &[u8]) {
            self.0.borrow_mut().sent.push(packet.to_vec());
        }

        fn destroy(&mut self) {
            self.0.borrow_mut().destroyed += 1;
        }
    }

    fn config() -> Config {
        Config::new(2, 100)
    }

    fn ids(reg: &Registry<Shared>) -> Vec<SessionId> {
        reg.iter().map(|(id, _)| id).collect()
    }

    #[test]
    fn insert_at_front() {
        let mut reg = Registry::new();
        let a = reg.insert(Shared::default(), &config());
        let b = reg.insert(Shared::default(), &config());
        let c = reg.insert(Shared::default(), &config());
        assert_eq!(ids(&reg), vec![c, b, a]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn unlink_middle_head_and_tail() {
        let mut reg = Registry::new();
        let a = reg.insert(Shared::default(), &config());
        let b = reg.insert(Shared::default(), &config());
        let c = reg.insert(Shared::default(), &config());
        let d = reg.insert(Shared::default(), &config());

        assert!(reg.unlink(b).is_some());
        assert_eq!(ids(&reg), vec![d, c, a]);
        assert!(reg.unlink(d).is_some());
        assert_eq!(ids(&reg), vec![c, a]);
        assert!(reg.unlink(a).is_some());
        assert_eq!(ids(&reg), vec![c]);
        assert!(reg.unlink(a).is_none());

        let e = reg.insert(Shared::default(), &config());
        assert_eq!(ids(&reg), vec![e, c]);
    }

    #[test]
    fn failed_connector_registers_nothing() {
        let mut reg: Registry<Shared> = Registry::new();
        let err = reg
            .connect(&config(), || {
                Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no route"))
            })
            .unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn successful_connector_registers_session() {
        let mut reg = Registry::new();
        let id = reg.connect(&config(), || Ok(Shared::default())).unwrap();
        assert!(reg.contains(id));
        assert_eq!(reg.get(id).unwrap().send_next(), 1);
    }

    #[test]
    fn unknown_handle_reported() {
        let mut reg: Registry<Shared> = Registry::new();
        let ghost = SessionId(7);
        assert!(matches!(
            reg.read(ghost, Instant::now()),
            Err(SessionError::UnknownSession(id)) if id == ghost
        ));
    }

    #[test]
    fn tick_visits_every_session() {
        let mut reg = Registry::new();
        let start = Instant::now();
        let conns: Vec<Shared> = (0..3).map(|_| Shared::default()).collect();
        let mut handles = Vec::new();
        for conn in &conns {
            conn.0.borrow_mut().input.extend_from_slice(b"data");
            let id = reg.insert(conn.clone(), &config());
            reg.read(id, start).unwrap();
            handles.push(id);
        }

        assert_eq!(reg.tick(start + Duration::from_millis(10)), 0);
        assert_eq!(reg.tick(start + Duration::from_millis(100)), 3);
        for conn in &conns {
            let log = conn.0.borrow();
            assert_eq!(log.sent.len(), 2);
            assert_eq!(log.sent[0], log.sent[1]);
        }
    }

    #[test]
    fn finished_session_destroyed_once() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let conn = Shared::default();
        conn.0.borrow_mut().eof = true;
        let id = reg.insert(conn.clone(), &config());

        let peer_eof = encode_data(1, 1, b"");
        assert_eq!(reg.receive(id, &peer_eof, peer_eof.len(), now).unwrap(), Status::Open);
        reg.read(id, now).unwrap();

        let ack = encode_ack(2);
        assert_eq!(reg.receive(id, &ack, ack.len(), now).unwrap(), Status::Finished);
        assert!(!reg.contains(id));
        assert!(reg.is_empty());
        assert_eq!(conn.0.borrow().destroyed, 1);

        // The handle is dead; further traffic is refused, not double-destroyed.
        assert!(matches!(
            reg.receive(id, &ack, ack.len(), now),
            Err(SessionError::UnknownSession(_))
        ));
        assert_eq!(conn.0.borrow().destroyed, 1);
    }
}
