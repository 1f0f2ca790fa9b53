// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Fixed-newstyle NBD server frontend. The handshake negotiates a single
//! export whose size is the device's `total_size`; the transmission phase
//! feeds read/write/flush/disconnect into the cached device. Replies are
//! written by a dedicated writer thread, so completions arriving from
//! pipeline threads never interleave on the socket.

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;

use anyhow::{Context, bail};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, error, info, trace, warn};

use crate::Error;
use crate::cache::CachedDevice;

const HANDSHAKE_MAGIC: &[u8; 8] = b"NBDMAGIC";
const OPTS_MAGIC: u64 = 0x4948_4156_454F_5054; // "IHAVEOPT"
const OPT_EXPORT_NAME: u32 = 1;

const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const FLAG_NO_ZEROES: u16 = 1 << 1;
const FLAG_C_NO_ZEROES: u32 = 1 << 1;

pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const REPLY_MAGIC: u32 = 0x6744_6698;

const CMD_MASK: u32 = 0xffff;
pub const CMD_READ: u32 = 0;
pub const CMD_WRITE: u32 = 1;
pub const CMD_DISC: u32 = 2;
pub const CMD_FLUSH: u32 = 3;

pub const ERR_PERM: u32 = 1;
pub const ERR_IO: u32 = 5;
pub const ERR_NOMEM: u32 = 12;
pub const ERR_INVAL: u32 = 22;
pub const ERR_NOSPC: u32 = 28;

struct Reply {
    error: u32,
    handle: [u8; 8],
    data: Option<Vec<u8>>,
}

/// Run the handshake and then serve requests until the client
/// disconnects. The caller still owns the device and ends it afterwards.
pub fn serve_connection(
    mut conn: TcpStream,
    device: &CachedDevice,
    flush_sync: bool,
) -> anyhow::Result<()> {
    handshake(&mut conn, device.total_size()).context("nbd handshake")?;
    transmission(conn, device, flush_sync)
}

fn handshake(conn: &mut TcpStream, export_size: u64) -> anyhow::Result<()> {
    conn.write_all(HANDSHAKE_MAGIC)?;
    conn.write_u64::<BigEndian>(OPTS_MAGIC)?;
    conn.write_u16::<BigEndian>(FLAG_FIXED_NEWSTYLE | FLAG_NO_ZEROES)?;

    let client_flags = conn.read_u32::<BigEndian>()?;
    let no_zeroes = client_flags & FLAG_C_NO_ZEROES != 0;
    let magic = conn.read_u64::<BigEndian>()?;
    if magic != OPTS_MAGIC {
        bail!("bad option magic {magic:#018x}");
    }
    let option = conn.read_u32::<BigEndian>()?;
    if option != OPT_EXPORT_NAME {
        bail!("unsupported option {option}");
    }
    let name_len = conn.read_u32::<BigEndian>()?;
    let mut name = vec![0u8; name_len as usize];
    conn.read_exact(&mut name)?;
    debug!(name = %String::from_utf8_lossy(&name), "export requested");

    conn.write_u64::<BigEndian>(export_size)?;
    conn.write_u16::<BigEndian>(0)?;
    if !no_zeroes {
        conn.write_all(&[0u8; 124])?;
    }
    Ok(())
}

fn transmission(conn: TcpStream, device: &CachedDevice, flush_sync: bool) -> anyhow::Result<()> {
    let (reply_tx, reply_rx) = flume::unbounded::<Reply>();
    let mut write_half = conn.try_clone().context("cloning connection")?;
    let writer = std::thread::Builder::new()
        .name("gbd-nbd-writer".into())
        .spawn(move || {
            for reply in reply_rx {
                if let Err(e) = write_reply(&mut write_half, &reply) {
                    error!("reply write failed: {e}");
                    break;
                }
            }
        })
        .context("spawning reply writer")?;

    let mut reader = BufReader::new(conn);
    let served = request_loop(&mut reader, device, flush_sync, &reply_tx);
    drop(reply_tx);
    let _ = writer.join();
    served
}

fn request_loop(
    conn: &mut impl Read,
    device: &CachedDevice,
    flush_sync: bool,
    reply_tx: &flume::Sender<Reply>,
) -> anyhow::Result<()> {
    loop {
        let magic = match conn.read_u32::<BigEndian>() {
            Ok(magic) => magic,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!("client hung up without disconnecting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if magic != REQUEST_MAGIC {
            bail!("bad request magic {magic:#010x}");
        }
        let ty = conn.read_u32::<BigEndian>()?;
        let mut handle = [0u8; 8];
        conn.read_exact(&mut handle)?;
        let offset = conn.read_u64::<BigEndian>()?;
        let length = conn.read_u32::<BigEndian>()?;
        if ty & !CMD_MASK != 0 {
            bail!("unexpected request flags {:#x}", ty & !CMD_MASK);
        }

        match ty & CMD_MASK {
            CMD_DISC => {
                info!("disconnect");
                return Ok(());
            }
            CMD_READ => {
                trace!(offset, length, "read");
                let reply_tx = reply_tx.clone();
                device.read_with(offset, u64::from(length), move |res| {
                    let reply = match res {
                        Ok(data) => Reply {
                            error: 0,
                            handle,
                            data: Some(data),
                        },
                        Err(e) => {
                            error!("read failed: {e}");
                            Reply {
                                error: errno(&e),
                                handle,
                                data: None,
                            }
                        }
                    };
                    drop(reply_tx.send(reply));
                });
            }
            CMD_WRITE => {
                let mut data = vec![0u8; length as usize];
                conn.read_exact(&mut data)?;
                trace!(offset, length, "write");
                let reply_tx = reply_tx.clone();
                device.write_with(offset, &data, move |res| {
                    let error = match res {
                        Ok(()) => 0,
                        Err(e) => {
                            error!("write failed: {e}");
                            errno(&e)
                        }
                    };
                    drop(reply_tx.send(Reply {
                        error,
                        handle,
                        data: None,
                    }));
                });
            }
            CMD_FLUSH => {
                // Queued work is already visible to the local cache; a
                // backend barrier is opt-in via `flush_sync`.
                trace!("flush");
                if flush_sync {
                    device.sync();
                }
                drop(reply_tx.send(Reply {
                    error: 0,
                    handle,
                    data: None,
                }));
            }
            cmd => {
                warn!(cmd, "unknown command");
                drop(reply_tx.send(Reply {
                    error: ERR_INVAL,
                    handle,
                    data: None,
                }));
            }
        }
    }
}

fn errno(e: &Error) -> u32 {
    match e {
        Error::OutOfRange { .. } | Error::ZeroLength => ERR_INVAL,
        _ => ERR_IO,
    }
}

fn write_reply(w: &mut impl Write, reply: &Reply) -> std::io::Result<()> {
    w.write_u32::<BigEndian>(REPLY_MAGIC)?;
    w.write_u32::<BigEndian>(reply.error)?;
    w.write_all(&reply.handle)?;
    if let Some(data) = &reply.data {
        w.write_all(data)?;
    }
    w.flush()
}
