//! Selection transfers
//!
//! Drop payloads travel through the `XdndSelection` selection. The requestor converts the
//! selection into a property on one of its windows, and the owner stores the data there.
//! Payloads too large for a single property are sent incrementally: the owner first stores
//! a property of type `INCR`, then writes one chunk every time the requestor deletes the
//! property, and finishes with a chunk of length zero.
//!
//! [`IncomingTransfer`] is the requestor side as a step machine driven by property
//! notifications, [`fetch_payload`] the blocking variant of it. [`OutgoingTransfer`] is the
//! owner side.

use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, trace, warn};

use super::{Atoms, DndConfig};
use crate::{
    connection::{
        predefined, Atom, ConnectionError, DisplayConnection, PropertyNotify, PropertyState, SelectionNotify,
        SelectionRequest, Window, NONE,
    },
    utils::{Timestamp, CURRENT_TIME},
};

/// Errors of a selection transfer
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The selection had no owner to convert it
    #[error("The selection has no owner")]
    NoSelectionOwner,
    /// The selection owner could not convert to the requested type
    #[error("The selection owner refused the conversion")]
    Refused,
    /// The converted property was missing, empty or not in format 8
    #[error("The selection property is malformed")]
    MalformedProperty,
    /// The selection owner stopped sending data
    #[error("The selection transfer timed out")]
    Timeout,
    /// The host refused the data
    #[error("The data was rejected")]
    Rejected,
    /// Another drag entered before the data arrived
    #[error("The transfer was superseded by another drag")]
    Superseded,
    /// The display connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Bytes received by a transfer
///
/// Chunk boundaries are not preserved, only the concatenated data has any meaning.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferBuffer {
    data: Vec<u8>,
}

impl TransferBuffer {
    /// An empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk
    pub fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing was received yet
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Take the buffered bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// Result of [`IncomingTransfer::start`]
#[derive(Debug)]
pub enum TransferStart {
    /// The data was stored in one piece
    Complete {
        /// Type of the data
        type_: Atom,
        /// The data
        data: Vec<u8>,
    },
    /// The owner sends the data incrementally
    Incremental(IncomingTransfer),
}

/// Progress of an incremental transfer
#[derive(Debug, PartialEq, Eq)]
pub enum TransferStep {
    /// The notification was not a new chunk
    Ignored,
    /// A chunk arrived
    Chunk(Vec<u8>),
    /// The terminating empty chunk arrived
    Finished,
}

/// The receiving side of an incremental transfer
#[derive(Debug)]
pub struct IncomingTransfer {
    window: Window,
    property: Atom,
    max_length: u32,
    timeout: Duration,
    last_activity: Instant,
    received: usize,
}

impl IncomingTransfer {
    /// Read the converted `property` of `window` after a successful `SelectionNotify`
    ///
    /// Complete data is deleted from the window and returned. For `INCR` data the property
    /// is deleted to ask for the first chunk, and the returned transfer has to be fed the
    /// property notifications of `window`.
    pub fn start<C: DisplayConnection + ?Sized>(
        conn: &C,
        atoms: &Atoms,
        window: Window,
        property: Atom,
        config: &DndConfig,
        now: Instant,
    ) -> Result<TransferStart, TransferError> {
        let peek = conn.get_property(window, property, predefined::ANY, 0, 0)?;
        if peek.is_none() {
            return Err(TransferError::MalformedProperty);
        }

        if peek.type_ == atoms.INCR {
            debug!(window, property, "Starting incremental selection transfer");
            conn.select_property_events(window)?;
            conn.delete_property(window, property)?;
            conn.flush()?;
            return Ok(TransferStart::Incremental(IncomingTransfer {
                window,
                property,
                max_length: config.max_property_length,
                timeout: config.transfer_timeout,
                last_activity: now,
                received: 0,
            }));
        }

        let reply = conn.get_property(window, property, predefined::ANY, 0, config.max_property_length)?;
        conn.delete_property(window, property)?;
        conn.flush()?;
        if reply.format != 8 || reply.value.is_empty() {
            warn!(
                window,
                format = reply.format,
                len = reply.value.len(),
                "Unusable selection property"
            );
            return Err(TransferError::MalformedProperty);
        }
        if reply.bytes_after > 0 {
            warn!(window, bytes_after = reply.bytes_after, "Selection data truncated");
        }
        Ok(TransferStart::Complete {
            type_: reply.type_,
            data: reply.value,
        })
    }

    /// Whether `notify` concerns this transfer
    pub fn matches(&self, notify: &PropertyNotify) -> bool {
        notify.window == self.window && notify.atom == self.property
    }

    /// Number of bytes received so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Advance the transfer on a property notification
    pub fn handle_property_notify<C: DisplayConnection + ?Sized>(
        &mut self,
        conn: &C,
        notify: &PropertyNotify,
        now: Instant,
    ) -> Result<TransferStep, TransferError> {
        if !self.matches(notify) || notify.state != PropertyState::NewValue {
            return Ok(TransferStep::Ignored);
        }

        let reply = conn.get_property(self.window, self.property, predefined::ANY, 0, self.max_length)?;
        if reply.is_none() {
            // already consumed, a later notification is still queued
            return Ok(TransferStep::Ignored);
        }
        conn.delete_property(self.window, self.property)?;
        conn.flush()?;
        self.last_activity = now;

        if reply.value.is_empty() {
            debug!(window = self.window, total = self.received, "Incremental transfer finished");
            return Ok(TransferStep::Finished);
        }
        if reply.format != 8 {
            warn!(window = self.window, format = reply.format, "Incremental chunk has the wrong format");
            return Err(TransferError::MalformedProperty);
        }

        self.received += reply.value.len();
        trace!(window = self.window, len = reply.value.len(), "Received chunk");
        Ok(TransferStep::Chunk(reply.value))
    }

    /// Fail if the owner was silent for too long
    pub fn check_timeout(&self, now: Instant) -> Result<(), TransferError> {
        if now.saturating_duration_since(self.last_activity) > self.timeout {
            warn!(window = self.window, received = self.received, "Incremental transfer timed out");
            return Err(TransferError::Timeout);
        }
        Ok(())
    }
}

/// Read a converted selection, blocking until the transfer ended
///
/// Every received chunk is passed to `sink`, which returns whether it accepted the data.
/// Complete data needs to have at least one byte. Incremental data is awaited by polling
/// for property notifications, sleeping [`DndConfig::poll_interval`] in between, and
/// aborted once [`DndConfig::transfer_timeout`] passes without a new chunk.
///
/// Returns the total number of bytes received.
pub fn fetch_payload<C, F>(
    conn: &C,
    atoms: &Atoms,
    window: Window,
    property: Atom,
    config: &DndConfig,
    mut sink: F,
) -> Result<usize, TransferError>
where
    C: DisplayConnection + ?Sized,
    F: FnMut(&[u8]) -> bool,
{
    let mut transfer = match IncomingTransfer::start(conn, atoms, window, property, config, Instant::now())? {
        TransferStart::Complete { data, .. } => {
            if !sink(&data) {
                return Err(TransferError::Rejected);
            }
            return Ok(data.len());
        }
        TransferStart::Incremental(transfer) => transfer,
    };

    loop {
        match conn.take_property_notify(window, property)? {
            Some(notify) => match transfer.handle_property_notify(conn, &notify, Instant::now())? {
                TransferStep::Ignored => {}
                TransferStep::Chunk(chunk) => {
                    if !sink(&chunk) {
                        return Err(TransferError::Rejected);
                    }
                }
                TransferStep::Finished => return Ok(transfer.received()),
            },
            None => {
                transfer.check_timeout(Instant::now())?;
                thread::sleep(config.poll_interval);
            }
        }
    }
}

/// Refuse a selection request
pub fn refuse_request<C: DisplayConnection + ?Sized>(
    conn: &C,
    request: &SelectionRequest,
) -> Result<(), ConnectionError> {
    conn.send_selection_notify(SelectionNotify {
        requestor: request.requestor,
        selection: request.selection,
        target: request.target,
        property: NONE,
        time: request.time,
    })?;
    conn.flush()
}

/// The sending side of an incremental transfer
#[derive(Debug)]
pub struct OutgoingTransfer {
    requestor: Window,
    property: Atom,
    type_: Atom,
    data: Vec<u8>,
    offset: usize,
    chunk_size: usize,
    timeout: Duration,
    last_activity: Instant,
}

impl OutgoingTransfer {
    /// Answer `request` with `data`
    ///
    /// Small payloads are stored right away. Payloads above [`DndConfig::incr_chunk_size`]
    /// start an incremental transfer, which is returned and has to be fed the property
    /// notifications of the requestor.
    pub fn serve<C: DisplayConnection + ?Sized>(
        conn: &C,
        atoms: &Atoms,
        request: &SelectionRequest,
        data: Vec<u8>,
        config: &DndConfig,
        now: Instant,
    ) -> Result<Option<OutgoingTransfer>, ConnectionError> {
        // obsolete clients leave the property to the owner
        let property = if request.property == NONE {
            request.target
        } else {
            request.property
        };

        let transfer = if data.len() > config.incr_chunk_size {
            debug!(
                requestor = request.requestor,
                len = data.len(),
                "Starting incremental transfer"
            );
            conn.select_property_events(request.requestor)?;
            conn.change_property32(request.requestor, property, atoms.INCR, &[data.len() as u32])?;
            Some(OutgoingTransfer {
                requestor: request.requestor,
                property,
                type_: request.target,
                data,
                offset: 0,
                chunk_size: config.incr_chunk_size.max(1),
                timeout: config.transfer_timeout,
                last_activity: now,
            })
        } else {
            trace!(requestor = request.requestor, len = data.len(), "Storing selection data");
            conn.change_property8(request.requestor, property, request.target, &data)?;
            None
        };

        conn.send_selection_notify(SelectionNotify {
            requestor: request.requestor,
            selection: request.selection,
            target: request.target,
            property,
            time: request.time,
        })?;
        conn.flush()?;
        Ok(transfer)
    }

    /// The window receiving the data
    pub fn requestor(&self) -> Window {
        self.requestor
    }

    /// Advance the transfer on a property notification
    ///
    /// Returns `true` once the terminating empty chunk was written.
    pub fn handle_property_notify<C: DisplayConnection + ?Sized>(
        &mut self,
        conn: &C,
        notify: &PropertyNotify,
        now: Instant,
    ) -> Result<bool, ConnectionError> {
        if notify.window != self.requestor || notify.atom != self.property || notify.state != PropertyState::Deleted {
            return Ok(false);
        }
        self.last_activity = now;

        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = &self.data[self.offset..end];
        trace!(requestor = self.requestor, len = chunk.len(), "Sending chunk");
        conn.change_property8(self.requestor, self.property, self.type_, chunk)?;
        conn.flush()?;

        let done = chunk.is_empty();
        self.offset = end;
        Ok(done)
    }

    /// Whether the requestor stopped reading
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout
    }
}

/// Time to put into a conversion request for a given event time
pub(crate) fn request_time(version: u32, time: Timestamp) -> Timestamp {
    if version >= 1 {
        time
    } else {
        CURRENT_TIME
    }
}
