//! # File-Stream Subsystem
//!
//! Lightweight flow-controlled byte streams carried in-band over the peer
//! link, created on demand whenever an IPC message crosses the proxy with
//! an embedded file descriptor.
//!
//! ## Creation
//!
//! On the side where the descriptor originates, the preprocessor inspects
//! its access mode: read-only means *we transmit* (an OUTGOING stream
//! reading from that very descriptor), write-only means *we receive* (an
//! INCOMING stream writing into it). Bidirectional descriptors are
//! rejected. The descriptor is made non-blocking, a fresh stream id is
//! allocated (smallest unused among our owned streams on that link), and
//! `{stream id, flags}` ride the message's metadata tail.
//!
//! On the remote side, receipt of that metadata creates the dual: same
//! stream id, ownership and direction inverted, a fresh pipe whose local
//! end is injected into the delivered IPC message so the receiving process
//! sees an ordinary descriptor.
//!
//! ## Flow Control
//!
//! The OUTGOING side transmits only against credit: the INCOMING side
//! sends `REQUEST_DATA` carrying `capacity − occupancy` of its pipe
//! whenever the pipe is writable and no request is outstanding. Chunks are
//! capped at [`crate::limits::FILESTREAM_PAYLOAD_MAX`]. EOF, local
//! hang-up, and I/O errors each map to a terminal flag; either terminal
//! flag drops the stream on both sides.
//!
//! The actual descriptor I/O happens in the runtime shell; this module
//! owns the stream table, the protocol decisions, and the frames.

use crate::error::ProxyError;
use crate::limits::FILESTREAM_PAYLOAD_MAX;
use crate::proxy::{Action, StreamDirection, StreamKey};
use crate::receiver::FsMessage;
use crate::sender;
use crate::tables::ProxyMsgIdAllocator;
use crate::wire::{CommonHeader, MessageType, StreamFlags};
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, info, warn};

/// One live stream instance. The tuple `(system, stream id, ownership)`
/// names it uniquely; the peer holds the dual with both bits inverted.
#[derive(Debug)]
pub struct FileStream {
    pub key: StreamKey,
    pub direction: StreamDirection,
    pub service_id: u32,
    /// Outstanding flow-control credit: on an outgoing stream, bytes the
    /// peer asked for; on an incoming stream, bytes we asked for.
    pub requested: u64,
}

/// The bounded stream table.
pub struct FileStreamTable {
    streams: Vec<FileStream>,
    capacity: usize,
}

/// Read a descriptor's status flags.
fn fd_status_flags(fd: &OwnedFd) -> std::io::Result<i32> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(flags)
}

/// Put a descriptor into non-blocking mode, preserving its other flags.
fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let flags = fd_status_flags(fd)?;
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl FileStreamTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Vec::new(),
            capacity,
        }
    }

    fn find(&self, key: &StreamKey) -> Option<usize> {
        self.streams.iter().position(|s| s.key == *key)
    }

    pub fn get(&self, key: &StreamKey) -> Option<&FileStream> {
        self.find(key).map(|i| &self.streams[i])
    }

    /// Smallest stream id not currently used by one of our owned streams
    /// on this link.
    fn alloc_stream_id(&self, system: &str) -> u16 {
        let mut id = 0u16;
        loop {
            let taken = self
                .streams
                .iter()
                .any(|s| s.key.owner && s.key.system == system && s.key.stream_id == id);
            if !taken {
                return id;
            }
            id += 1;
        }
    }

    fn header(
        &self,
        ids: &mut ProxyMsgIdAllocator,
        service_id: u32,
    ) -> CommonHeader {
        CommonHeader {
            id: ids.next(|_| false),
            service_id,
            msg_type: MessageType::FilestreamMessage,
        }
    }

    /// Preprocess an outgoing IPC message's embedded descriptor into a new
    /// owned stream. Returns the `{stream id, flags}` metadata to append
    /// to the message.
    pub fn prepare_outgoing(
        &mut self,
        system: &str,
        service_id: u32,
        fd: OwnedFd,
        actions: &mut Vec<Action>,
    ) -> Result<(u16, StreamFlags), ProxyError> {
        if self.streams.len() >= self.capacity {
            return Err(ProxyError::ResourceExhausted("file streams"));
        }
        let status = fd_status_flags(&fd).map_err(|e| ProxyError::Fabric(e.to_string()))?;
        let was_nonblocking = status & libc::O_NONBLOCK != 0;
        let direction = match status & libc::O_ACCMODE {
            libc::O_RDONLY => StreamDirection::Outgoing,
            libc::O_WRONLY => StreamDirection::Incoming,
            _ => {
                return Err(ProxyError::Fabric(
                    "bidirectional descriptors are not supported in messages".into(),
                ))
            }
        };
        set_nonblocking(&fd).map_err(|e| ProxyError::Fabric(e.to_string()))?;

        let stream_id = self.alloc_stream_id(system);
        let key = StreamKey {
            system: system.to_owned(),
            stream_id,
            owner: true,
        };
        let mut flags = StreamFlags::OWNER;
        flags |= match direction {
            StreamDirection::Outgoing => StreamFlags::INIT_OUTGOING,
            StreamDirection::Incoming => StreamFlags::INIT_INCOMING,
        };
        if was_nonblocking {
            flags |= StreamFlags::NONBLOCK;
        }

        info!(
            system,
            stream_id,
            ?direction,
            "created owned file stream for embedded descriptor"
        );
        self.streams.push(FileStream {
            key: key.clone(),
            direction,
            service_id,
            requested: 0,
        });
        actions.push(Action::WatchStream {
            key,
            fd,
            direction,
        });
        Ok((stream_id, flags))
    }

    /// Create the dual of a stream announced in an incoming message's
    /// metadata. Returns the local pipe end to inject into the delivered
    /// IPC message.
    pub fn create_dual(
        &mut self,
        system: &str,
        service_id: u32,
        stream_id: u16,
        flags: StreamFlags,
        actions: &mut Vec<Action>,
    ) -> Result<OwnedFd, ProxyError> {
        flags.validate()?;
        if !flags.contains(StreamFlags::OWNER) {
            return Err(ProxyError::format(
                "stream initialization without the owner bit",
            ));
        }
        if self.streams.len() >= self.capacity {
            return Err(ProxyError::ResourceExhausted("file streams"));
        }
        // Our view is the inverse of the announcing side's.
        let direction = if flags.contains(StreamFlags::INIT_OUTGOING) {
            StreamDirection::Incoming
        } else if flags.contains(StreamFlags::INIT_INCOMING) {
            StreamDirection::Outgoing
        } else {
            return Err(ProxyError::format(
                "stream initialization without a direction",
            ));
        };
        let key = StreamKey {
            system: system.to_owned(),
            stream_id,
            owner: false,
        };
        if self.find(&key).is_some() {
            return Err(ProxyError::format(format!(
                "duplicate initialization for stream {stream_id}"
            )));
        }

        let (read_end, write_end) =
            nix::unistd::pipe().map_err(|e| ProxyError::Fabric(e.to_string()))?;
        // Incoming data is written into the pipe for the local process to
        // read; outgoing data is read out of the pipe the local process
        // writes.
        let (rpc_fd, local_fd) = match direction {
            StreamDirection::Incoming => (write_end, read_end),
            StreamDirection::Outgoing => (read_end, write_end),
        };
        set_nonblocking(&rpc_fd).map_err(|e| ProxyError::Fabric(e.to_string()))?;
        if flags.contains(StreamFlags::NONBLOCK) {
            set_nonblocking(&local_fd).map_err(|e| ProxyError::Fabric(e.to_string()))?;
        }

        info!(system, stream_id, ?direction, "created dual file stream");
        self.streams.push(FileStream {
            key: key.clone(),
            direction,
            service_id,
            requested: 0,
        });
        actions.push(Action::WatchStream {
            key,
            fd: rpc_fd,
            direction,
        });
        Ok(local_fd)
    }

    /// Process an inbound FILESTREAM_MESSAGE.
    pub fn handle_message(
        &mut self,
        system: &str,
        msg: FsMessage,
        ids: &mut ProxyMsgIdAllocator,
        actions: &mut Vec<Action>,
    ) -> Result<(), ProxyError> {
        let terminal = msg
            .flags
            .intersects(StreamFlags::FORCE_CLOSE | StreamFlags::IOERROR);
        // Our record of a stream the peer names is always the dual of the
        // peer's view.
        let key = StreamKey {
            system: system.to_owned(),
            stream_id: msg.stream_id,
            owner: !msg.flags.contains(StreamFlags::OWNER),
        };

        if msg.flags.validate().is_err()
            || msg
                .flags
                .intersects(StreamFlags::INIT_INCOMING | StreamFlags::INIT_OUTGOING)
        {
            warn!(system, stream_id = msg.stream_id, flags = ?msg.flags,
                  "inconsistent file-stream flags; dropping stream");
            if let Some(stream) = self.find(&key).map(|i| self.streams.remove(i)) {
                self.send_flags_only(ids, &stream, StreamFlags::FORCE_CLOSE, actions);
                actions.push(Action::UnwatchStream { key: stream.key });
            }
            return Ok(());
        }

        let Some(index) = self.find(&key) else {
            // A late message for a stream already torn down locally. Never
            // answer a terminal flag, or two proxies would ping-pong
            // closes forever.
            if !terminal {
                debug!(system, stream_id = msg.stream_id, "message for unknown stream");
                let flags = StreamFlags::FORCE_CLOSE
                    | if key.owner {
                        StreamFlags::OWNER
                    } else {
                        StreamFlags::empty()
                    };
                let header = self.header(ids, 0);
                actions.push(Action::SendFrame {
                    system: system.to_owned(),
                    frame: sender::filestream_frame(&header, msg.stream_id, flags, None, None),
                });
            }
            return Ok(());
        };

        if terminal {
            let stream = self.streams.remove(index);
            info!(system, stream_id = msg.stream_id, "peer closed stream");
            actions.push(Action::UnwatchStream { key: stream.key });
            return Ok(());
        }

        if msg.flags.contains(StreamFlags::REQUEST_DATA) {
            let Some(wanted) = msg.requested else {
                return self.drop_with_force_close(index, ids, actions);
            };
            let stream = &mut self.streams[index];
            if stream.direction != StreamDirection::Outgoing {
                return self.drop_with_force_close(index, ids, actions);
            }
            // The most recent outstanding request replaces any earlier one.
            stream.requested = wanted;
            if wanted > 0 {
                actions.push(Action::ArmStreamRead {
                    key: stream.key.clone(),
                    max: (wanted as usize).min(FILESTREAM_PAYLOAD_MAX),
                });
            }
            return Ok(());
        }

        if msg.flags.contains(StreamFlags::DATA_PACKET) || msg.flags.contains(StreamFlags::EOF) {
            let stream = &mut self.streams[index];
            if stream.direction != StreamDirection::Incoming {
                return self.drop_with_force_close(index, ids, actions);
            }
            let data = msg.payload.unwrap_or_default();
            if (data.len() as u64) > stream.requested {
                // Flow-control violation: the peer sent more than we asked.
                warn!(
                    system,
                    stream_id = msg.stream_id,
                    sent = data.len(),
                    credit = stream.requested,
                    "peer overran stream credit"
                );
                return self.drop_with_force_close(index, ids, actions);
            }
            stream.requested -= data.len() as u64;
            if !data.is_empty() {
                actions.push(Action::WriteStream {
                    key: stream.key.clone(),
                    data,
                });
            }
            if msg.flags.contains(StreamFlags::EOF) {
                let stream = self.streams.remove(index);
                info!(system, stream_id = msg.stream_id, "stream reached end of file");
                actions.push(Action::UnwatchStream { key: stream.key });
            }
            return Ok(());
        }

        // A filestream message carrying none of the action flags.
        self.drop_with_force_close(index, ids, actions)
    }

    /// The shell read `data` from an outgoing stream's descriptor.
    pub fn on_chunk(
        &mut self,
        key: &StreamKey,
        data: Vec<u8>,
        eof: bool,
        ids: &mut ProxyMsgIdAllocator,
        actions: &mut Vec<Action>,
    ) {
        let Some(index) = self.find(key) else {
            return;
        };
        let (service_id, owner, remaining) = {
            let stream = &mut self.streams[index];
            debug_assert_eq!(stream.direction, StreamDirection::Outgoing);
            stream.requested = stream.requested.saturating_sub(data.len() as u64);
            (stream.service_id, stream.key.owner, stream.requested)
        };

        let mut flags = StreamFlags::empty();
        if owner {
            flags |= StreamFlags::OWNER;
        }
        if !data.is_empty() {
            flags |= StreamFlags::DATA_PACKET;
        }
        if eof {
            flags |= StreamFlags::EOF;
        }

        if !flags.is_empty() {
            let header = self.header(ids, service_id);
            let payload = (!data.is_empty()).then_some(data.as_slice());
            actions.push(Action::SendFrame {
                system: key.system.clone(),
                frame: sender::filestream_frame(&header, key.stream_id, flags, None, payload),
            });
        }

        if eof {
            let stream = self.streams.remove(index);
            actions.push(Action::UnwatchStream { key: stream.key });
        } else if remaining > 0 {
            let max = (remaining as usize).min(FILESTREAM_PAYLOAD_MAX);
            actions.push(Action::ArmStreamRead {
                key: key.clone(),
                max,
            });
        }
    }

    /// The shell observed room in an incoming stream's pipe.
    pub fn on_writable(
        &mut self,
        key: &StreamKey,
        room: usize,
        ids: &mut ProxyMsgIdAllocator,
        actions: &mut Vec<Action>,
    ) {
        let Some(index) = self.find(key) else {
            return;
        };
        let (service_id, owner) = {
            let stream = &mut self.streams[index];
            if stream.direction != StreamDirection::Incoming
                || stream.requested > 0
                || room == 0
            {
                return;
            }
            stream.requested = room as u64;
            (stream.service_id, stream.key.owner)
        };
        let mut flags = StreamFlags::REQUEST_DATA;
        if owner {
            flags |= StreamFlags::OWNER;
        }
        let header = self.header(ids, service_id);
        actions.push(Action::SendFrame {
            system: key.system.clone(),
            frame: sender::filestream_frame(
                &header,
                key.stream_id,
                flags,
                Some(room as u64),
                None,
            ),
        });
    }

    /// Local hang-up on the proxy-side descriptor: the user-facing end is
    /// gone, tell the peer and drop the stream.
    pub fn on_hup(
        &mut self,
        key: &StreamKey,
        ids: &mut ProxyMsgIdAllocator,
        actions: &mut Vec<Action>,
    ) {
        if let Some(index) = self.find(key) {
            let stream = self.streams.remove(index);
            info!(system = %key.system, stream_id = key.stream_id, "local end closed, forcing stream shut");
            self.send_flags_only(ids, &stream, StreamFlags::FORCE_CLOSE, actions);
            actions.push(Action::UnwatchStream { key: stream.key });
        }
    }

    /// Local I/O error on the proxy-side descriptor.
    pub fn on_io_error(
        &mut self,
        key: &StreamKey,
        ids: &mut ProxyMsgIdAllocator,
        actions: &mut Vec<Action>,
    ) {
        if let Some(index) = self.find(key) {
            let stream = self.streams.remove(index);
            warn!(system = %key.system, stream_id = key.stream_id, "stream i/o error");
            self.send_flags_only(ids, &stream, StreamFlags::IOERROR, actions);
            actions.push(Action::UnwatchStream { key: stream.key });
        }
    }

    /// Tear down every stream owned by a disconnecting service. The link
    /// is still up, so the peer is told.
    pub fn teardown_service(
        &mut self,
        system: &str,
        service_id: u32,
        ids: &mut ProxyMsgIdAllocator,
        actions: &mut Vec<Action>,
    ) {
        let mut index = 0;
        while index < self.streams.len() {
            if self.streams[index].key.system == system
                && self.streams[index].service_id == service_id
            {
                let stream = self.streams.remove(index);
                self.send_flags_only(ids, &stream, StreamFlags::FORCE_CLOSE, actions);
                actions.push(Action::UnwatchStream { key: stream.key });
            } else {
                index += 1;
            }
        }
    }

    /// Tear down every stream on a dead link. The peer is gone; no wire
    /// message is sent.
    pub fn teardown_system(&mut self, system: &str, actions: &mut Vec<Action>) {
        let mut index = 0;
        while index < self.streams.len() {
            if self.streams[index].key.system == system {
                let stream = self.streams.remove(index);
                actions.push(Action::UnwatchStream { key: stream.key });
            } else {
                index += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn drop_with_force_close(
        &mut self,
        index: usize,
        ids: &mut ProxyMsgIdAllocator,
        actions: &mut Vec<Action>,
    ) -> Result<(), ProxyError> {
        let stream = self.streams.remove(index);
        self.send_flags_only(ids, &stream, StreamFlags::FORCE_CLOSE, actions);
        actions.push(Action::UnwatchStream {
            key: stream.key.clone(),
        });
        Ok(())
    }

    fn send_flags_only(
        &self,
        ids: &mut ProxyMsgIdAllocator,
        stream: &FileStream,
        mut flags: StreamFlags,
        actions: &mut Vec<Action>,
    ) {
        if stream.key.owner {
            flags |= StreamFlags::OWNER;
        }
        let header = self.header(ids, stream.service_id);
        actions.push(Action::SendFrame {
            system: stream.key.system.clone(),
            frame: sender::filestream_frame(&header, stream.key.stream_id, flags, None, None),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (FileStreamTable, ProxyMsgIdAllocator, Vec<Action>) {
        (
            FileStreamTable::new(4),
            ProxyMsgIdAllocator::default(),
            Vec::new(),
        )
    }

    fn read_only_fd() -> OwnedFd {
        // The read end of a pipe is O_RDONLY, exactly what a client would
        // hand over for upload.
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        std::mem::forget(_write_end);
        read_end
    }

    #[test]
    fn outgoing_preprocess_assigns_smallest_free_id() {
        let (mut table, _ids, mut actions) = table();
        let (id0, flags) = table
            .prepare_outgoing("B", 7, read_only_fd(), &mut actions)
            .unwrap();
        assert_eq!(id0, 0);
        assert!(flags.contains(StreamFlags::OWNER));
        assert!(flags.contains(StreamFlags::INIT_OUTGOING));

        let (id1, _) = table
            .prepare_outgoing("B", 7, read_only_fd(), &mut actions)
            .unwrap();
        assert_eq!(id1, 1);
        // A different link has its own id space.
        let (other, _) = table
            .prepare_outgoing("C", 3, read_only_fd(), &mut actions)
            .unwrap();
        assert_eq!(other, 0);
        assert!(matches!(actions[0], Action::WatchStream { .. }));
    }

    #[test]
    fn dual_creation_inverts_owner_and_direction() {
        let (mut table, _ids, mut actions) = table();
        let local = table
            .create_dual(
                "A",
                7,
                0,
                StreamFlags::OWNER | StreamFlags::INIT_OUTGOING,
                &mut actions,
            )
            .unwrap();
        // Peer transmits, so our side receives: the local end must be the
        // readable end of the pipe.
        let status = fd_status_flags(&local).unwrap();
        assert_eq!(status & libc::O_ACCMODE, libc::O_RDONLY);
        let stream = table
            .get(&StreamKey {
                system: "A".into(),
                stream_id: 0,
                owner: false,
            })
            .unwrap();
        assert_eq!(stream.direction, StreamDirection::Incoming);
    }

    #[test]
    fn duplicate_dual_is_a_format_error() {
        let (mut table, _ids, mut actions) = table();
        let flags = StreamFlags::OWNER | StreamFlags::INIT_OUTGOING;
        table.create_dual("A", 7, 0, flags, &mut actions).unwrap();
        assert!(table.create_dual("A", 7, 0, flags, &mut actions).is_err());
    }

    #[test]
    fn request_data_arms_reading_with_chunk_cap() {
        let (mut table, mut ids, mut actions) = table();
        table
            .prepare_outgoing("B", 7, read_only_fd(), &mut actions)
            .unwrap();
        actions.clear();

        table
            .handle_message(
                "B",
                FsMessage {
                    stream_id: 0,
                    // The peer's dual is not the owner.
                    flags: StreamFlags::REQUEST_DATA,
                    requested: Some(1 << 20),
                    payload: None,
                },
                &mut ids,
                &mut actions,
            )
            .unwrap();
        match &actions[0] {
            Action::ArmStreamRead { max, .. } => assert_eq!(*max, FILESTREAM_PAYLOAD_MAX),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn data_over_credit_forces_close() {
        let (mut table, mut ids, mut actions) = table();
        table
            .create_dual(
                "A",
                7,
                0,
                StreamFlags::OWNER | StreamFlags::INIT_OUTGOING,
                &mut actions,
            )
            .unwrap();
        actions.clear();

        // No credit asked, yet data arrives.
        table
            .handle_message(
                "A",
                FsMessage {
                    stream_id: 0,
                    flags: StreamFlags::OWNER | StreamFlags::DATA_PACKET,
                    requested: None,
                    payload: Some(vec![0u8; 10]),
                },
                &mut ids,
                &mut actions,
            )
            .unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::SendFrame { .. })));
        assert!(table.is_empty());
    }

    #[test]
    fn conflicting_flags_drop_the_stream() {
        let (mut table, mut ids, mut actions) = table();
        table
            .create_dual(
                "A",
                7,
                3,
                StreamFlags::OWNER | StreamFlags::INIT_OUTGOING,
                &mut actions,
            )
            .unwrap();
        actions.clear();
        table
            .handle_message(
                "A",
                FsMessage {
                    stream_id: 3,
                    flags: StreamFlags::OWNER
                        | StreamFlags::DATA_PACKET
                        | StreamFlags::REQUEST_DATA,
                    requested: Some(4),
                    payload: Some(vec![1]),
                },
                &mut ids,
                &mut actions,
            )
            .unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn eof_chunk_sends_final_frame_and_tears_down() {
        let (mut table, mut ids, mut actions) = table();
        table
            .prepare_outgoing("B", 7, read_only_fd(), &mut actions)
            .unwrap();
        let key = StreamKey {
            system: "B".into(),
            stream_id: 0,
            owner: true,
        };
        actions.clear();

        table.on_chunk(&key, vec![1, 2, 3], true, &mut ids, &mut actions);
        assert!(matches!(actions[0], Action::SendFrame { .. }));
        assert!(matches!(actions[1], Action::UnwatchStream { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn writable_requests_room_once() {
        let (mut table, mut ids, mut actions) = table();
        table
            .create_dual(
                "A",
                7,
                0,
                StreamFlags::OWNER | StreamFlags::INIT_OUTGOING,
                &mut actions,
            )
            .unwrap();
        let key = StreamKey {
            system: "A".into(),
            stream_id: 0,
            owner: false,
        };
        actions.clear();

        table.on_writable(&key, 2048, &mut ids, &mut actions);
        assert_eq!(actions.len(), 1);
        // Credit outstanding: a second writable report is ignored.
        table.on_writable(&key, 2048, &mut ids, &mut actions);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn service_teardown_notifies_peer_link_loss_does_not() {
        let (mut table, mut ids, mut actions) = table();
        table
            .prepare_outgoing("B", 7, read_only_fd(), &mut actions)
            .unwrap();
        table
            .prepare_outgoing("B", 9, read_only_fd(), &mut actions)
            .unwrap();
        actions.clear();

        table.teardown_service("B", 7, &mut ids, &mut actions);
        assert!(actions.iter().any(|a| matches!(a, Action::SendFrame { .. })));
        assert_eq!(table.len(), 1);

        actions.clear();
        table.teardown_system("B", &mut actions);
        assert!(actions.iter().all(|a| matches!(a, Action::UnwatchStream { .. })));
        assert!(table.is_empty());
    }
}
