// packets.rs — work-distribution wire format
//
// Every message is [packet id][sub id][body]. The packet id namespaces
// this subsystem inside a larger protocol; the sub id dispatches within
// it. Work-unit indices are 64-bit. Results carry a CRC so a desynced
// build mismatch shows up as a hard error instead of silent corruption.

use myrad_common::checksum::crc_block;
use myrad_common::msgbuf::{
    msg_begin_reading, msg_read_byte, msg_read_data, msg_read_long, msg_read_string,
    msg_read_u64, msg_truncated, msg_write_byte, msg_write_data, msg_write_long,
    msg_write_string, msg_write_u64, SizeBuf,
};

/// Packet id of the work-distribution subsystem.
pub const MPI_PACKET_ID: u8 = 31;

// Sub-packet ids
pub const MPI_SUB_ASSIGN: u8 = 0;
pub const MPI_SUB_RESULTS: u8 = 1;
pub const MPI_SUB_FILE_DATA: u8 = 2;
pub const MPI_SUB_FILE_ANNOUNCE: u8 = 3;
pub const MPI_SUB_DONE: u8 = 4;

/// Upper bound on a single framed message.
pub const MAX_MPI_PACKET: usize = 0x1000000; // 16 MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MpiPacket {
    /// Master -> worker: compute this unit
    AssignWorkUnit { unit: u64 },
    /// Worker -> master: one unit's serialized results
    WorkUnitResults { unit: u64, payload: Vec<u8> },
    /// Master -> worker: out-of-band blob for the virtual file store
    FileData { name: String, data: Vec<u8> },
    /// Master -> worker: a named blob is ready (e.g. the light data)
    FileAnnounce { name: String },
    /// Master -> worker: the pass is complete, shut down cleanly
    Done,
}

impl MpiPacket {
    pub fn encode(&self) -> Vec<u8> {
        let size = match self {
            MpiPacket::WorkUnitResults { payload, .. } => payload.len() + 64,
            MpiPacket::FileData { data, name } => data.len() + name.len() + 64,
            MpiPacket::FileAnnounce { name } => name.len() + 64,
            _ => 64,
        };
        let mut sb = SizeBuf::new(size);
        msg_write_byte(&mut sb, MPI_PACKET_ID);
        match self {
            MpiPacket::AssignWorkUnit { unit } => {
                msg_write_byte(&mut sb, MPI_SUB_ASSIGN);
                msg_write_u64(&mut sb, *unit);
            }
            MpiPacket::WorkUnitResults { unit, payload } => {
                msg_write_byte(&mut sb, MPI_SUB_RESULTS);
                msg_write_u64(&mut sb, *unit);
                msg_write_long(&mut sb, crc_block(payload) as i32);
                msg_write_data(&mut sb, payload);
            }
            MpiPacket::FileData { name, data } => {
                msg_write_byte(&mut sb, MPI_SUB_FILE_DATA);
                msg_write_string(&mut sb, name);
                msg_write_data(&mut sb, data);
            }
            MpiPacket::FileAnnounce { name } => {
                msg_write_byte(&mut sb, MPI_SUB_FILE_ANNOUNCE);
                msg_write_string(&mut sb, name);
            }
            MpiPacket::Done => {
                msg_write_byte(&mut sb, MPI_SUB_DONE);
            }
        }
        sb.as_slice().to_vec()
    }

    /// Decode one framed message. Any malformation (unknown ids,
    /// truncation, checksum mismatch) is an error the caller treats as
    /// a fatal protocol desync.
    pub fn decode(data: &[u8]) -> Result<MpiPacket, String> {
        if data.len() > MAX_MPI_PACKET {
            return Err(format!("oversized packet ({} bytes)", data.len()));
        }
        let mut sb = SizeBuf::from_bytes(data);
        msg_begin_reading(&mut sb);

        let id = msg_read_byte(&mut sb);
        if id != MPI_PACKET_ID as i32 {
            return Err(format!("wrong packet id {}", id));
        }
        let sub = msg_read_byte(&mut sb);
        let packet = match sub as u8 {
            MPI_SUB_ASSIGN => MpiPacket::AssignWorkUnit {
                unit: msg_read_u64(&mut sb),
            },
            MPI_SUB_RESULTS => {
                let unit = msg_read_u64(&mut sb);
                let crc = msg_read_long(&mut sb) as u32;
                let payload = msg_read_data(&mut sb)
                    .ok_or_else(|| "truncated results payload".to_string())?;
                if crc_block(&payload) != crc {
                    return Err(format!("results checksum mismatch on unit {}", unit));
                }
                MpiPacket::WorkUnitResults { unit, payload }
            }
            MPI_SUB_FILE_DATA => {
                let name = msg_read_string(&mut sb);
                let data = msg_read_data(&mut sb)
                    .ok_or_else(|| "truncated file payload".to_string())?;
                MpiPacket::FileData { name, data }
            }
            MPI_SUB_FILE_ANNOUNCE => MpiPacket::FileAnnounce {
                name: msg_read_string(&mut sb),
            },
            MPI_SUB_DONE => MpiPacket::Done,
            _ => return Err(format!("unknown sub-packet id {}", sub)),
        };
        if msg_truncated(&sb) {
            return Err("truncated packet".to_string());
        }
        Ok(packet)
    }
}

// ============================================================
// Tests
// ============================================================
