//! RTU transaction queue
//!
//! A bounded multi-producer/single-consumer byte ring carrying
//! `(session, request PDU)` entries of variable length. Client handlers push,
//! the RTU task pops. An entry is written under one lock acquisition and only
//! after the whole entry is known to fit, so the consumer never observes a
//! partial entry even when it straddles the physical end of the ring.
//!
//! Entry layout: `[u16 LE body length][13-byte session][PDU]`.

use bytes::Bytes;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::Session;
use crate::ring::RingBuffer;

/// Length prefix of a queue entry
const ENTRY_PREFIX: usize = 2;

/// One dequeued request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTransaction {
    pub session: Session,
    pub pdu: Bytes,
}

#[derive(Debug)]
struct Inner {
    ring: RingBuffer,
    entries: usize,
}

#[derive(Debug)]
pub struct TransactionQueue {
    inner: Mutex<Inner>,
    /// Signalled once per pushed entry
    items: Notify,
    /// Signalled to every waiting producer when an entry leaves
    space: Notify,
}

impl TransactionQueue {
    /// Creates a queue with `capacity` bytes of ring storage
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: RingBuffer::with_capacity(capacity),
                entries: 0,
            }),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Ring bytes an entry carrying `pdu_len` PDU bytes occupies
    pub fn entry_len(pdu_len: usize) -> usize {
        ENTRY_PREFIX + Session::ENCODED_LEN + pdu_len
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // ring state stays consistent across a panicking holder: every
        // mutation completes before the guard drops
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity()
    }

    /// Entries waiting for the RTU task
    pub fn len(&self) -> usize {
        self.lock().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free ring bytes
    pub fn vacancy(&self) -> usize {
        self.lock().ring.vacancy()
    }

    /// Push an entry if it fits, without waiting
    ///
    /// Returns false when the ring lacks room; nothing is written in that case.
    pub fn try_enqueue(&self, session: &Session, pdu: &[u8]) -> bool {
        let body_len = Session::ENCODED_LEN + pdu.len();
        let mut prefix = [0u8; ENTRY_PREFIX];
        LittleEndian::write_u16(&mut prefix, body_len as u16);

        {
            let mut inner = self.lock();
            if inner.ring.vacancy() < ENTRY_PREFIX + body_len {
                return false;
            }
            inner.ring.push_slice(&prefix);
            inner.ring.push_slice(&session.encode());
            inner.ring.push_slice(pdu);
            inner.entries += 1;
        }

        self.items.notify_one();
        true
    }

    /// Push an entry, waiting for the consumer to free room if needed
    ///
    /// Fails immediately if the entry could never fit.
    pub async fn enqueue(&self, session: &Session, pdu: &[u8]) -> ModbusResult<()> {
        let needed = Self::entry_len(pdu.len());
        let capacity = self.capacity();
        if needed > capacity {
            return Err(ModbusError::queue_full(needed, capacity));
        }

        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_enqueue(session, pdu) {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Future resolving the next time an entry leaves the queue
    ///
    /// Call [`Notified::enable`] on it before retrying a push to avoid missing
    /// a wakeup between the failed push and the wait.
    pub fn space_available(&self) -> Notified<'_> {
        self.space.notified()
    }

    /// Pop the oldest entry if there is one
    pub fn try_dequeue(&self) -> Option<QueuedTransaction> {
        let transaction = {
            let mut inner = self.lock();
            let mut prefix = [0u8; ENTRY_PREFIX];
            if !inner.ring.peek_into(0, &mut prefix) {
                return None;
            }
            let body_len = LittleEndian::read_u16(&prefix) as usize;

            let mut session = [0u8; Session::ENCODED_LEN];
            let mut pdu = vec![0u8; body_len.saturating_sub(Session::ENCODED_LEN)];
            if !inner.ring.peek_into(ENTRY_PREFIX, &mut session)
                || !inner.ring.peek_into(ENTRY_PREFIX + Session::ENCODED_LEN, &mut pdu)
            {
                // entries are pushed whole, so a short entry means the ring is corrupt
                log::error!("Transaction queue holds a truncated entry, discarding contents");
                inner.ring.clear();
                inner.entries = 0;
                return None;
            }

            inner.ring.pop(ENTRY_PREFIX + body_len);
            inner.entries -= 1;

            QueuedTransaction {
                session: Session::decode(&session),
                pdu: Bytes::from(pdu),
            }
        };

        self.space.notify_waiters();
        Some(transaction)
    }

    /// Pop the oldest entry, waiting indefinitely for one to arrive
    pub async fn dequeue(&self) -> QueuedTransaction {
        loop {
            if let Some(transaction) = self.try_dequeue() {
                return transaction;
            }
            self.items.notified().await;
        }
    }
}
