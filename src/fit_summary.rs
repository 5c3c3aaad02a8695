//! Lightweight FIT metadata for display.
//!
//! Only the first `session` message is decoded (sport and total elapsed
//! time). Anything unexpected yields `None`; the file is still listed.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Files larger than this are not parsed for a summary.
const MAX_SUMMARY_BYTES: u64 = 16 * 1024 * 1024;

const FIT_SIGNATURE: &[u8; 4] = b".FIT";
const MESG_SESSION: u16 = 18;
const FIELD_SPORT: u8 = 5;
const FIELD_TOTAL_ELAPSED_TIME: u8 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub sport: String,
    pub duration_secs: Option<u64>,
}

/// Optional metadata strategy injected into the indexer.
pub trait ActivitySummaryParser: Send + Sync {
    fn summarize(&self, path: &Path) -> Option<ActivitySummary>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FitSessionParser;

impl ActivitySummaryParser for FitSessionParser {
    fn summarize(&self, path: &Path) -> Option<ActivitySummary> {
        let size = std::fs::metadata(path).ok()?.len();
        if size > MAX_SUMMARY_BYTES {
            return None;
        }
        let data = std::fs::read(path).ok()?;
        parse_session_summary(&data)
    }
}

#[derive(Debug, Clone)]
struct Definition {
    global: u16,
    big_endian: bool,
    fields: Vec<(u8, usize)>,
    developer_bytes: usize,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }
}

pub fn parse_session_summary(data: &[u8]) -> Option<ActivitySummary> {
    let header_size = *data.first()? as usize;
    if header_size < 12 || data.get(8..12)? != FIT_SIGNATURE {
        return None;
    }
    let data_size = u32::from_le_bytes(data.get(4..8)?.try_into().ok()?) as usize;
    let records = data.get(header_size..header_size.checked_add(data_size)?)?;

    let mut definitions: [Option<Definition>; 16] = Default::default();
    let mut cursor = Cursor {
        data: records,
        pos: 0,
    };

    while cursor.pos < records.len() {
        let header = cursor.u8()?;

        if header & 0x80 != 0 {
            // Compressed timestamp header: always a data message
            let local = ((header >> 5) & 0x03) as usize;
            let def = definitions[local].clone()?;
            if let Some(summary) = read_data(&mut cursor, &def)? {
                return Some(summary);
            }
        } else if header & 0x40 != 0 {
            let local = (header & 0x0F) as usize;
            let has_developer = header & 0x20 != 0;
            definitions[local] = Some(read_definition(&mut cursor, has_developer)?);
        } else {
            let local = (header & 0x0F) as usize;
            let def = definitions[local].clone()?;
            if let Some(summary) = read_data(&mut cursor, &def)? {
                return Some(summary);
            }
        }
    }

    None
}

fn read_definition(cursor: &mut Cursor<'_>, has_developer: bool) -> Option<Definition> {
    let _reserved = cursor.u8()?;
    let big_endian = cursor.u8()? == 1;
    let raw = cursor.take(2)?;
    let global = if big_endian {
        u16::from_be_bytes([raw[0], raw[1]])
    } else {
        u16::from_le_bytes([raw[0], raw[1]])
    };

    let count = cursor.u8()?;
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let def = cursor.take(3)?;
        fields.push((def[0], def[1] as usize));
    }

    let mut developer_bytes = 0;
    if has_developer {
        let dev_count = cursor.u8()?;
        for _ in 0..dev_count {
            developer_bytes += cursor.take(3)?[1] as usize;
        }
    }

    Some(Definition {
        global,
        big_endian,
        fields,
        developer_bytes,
    })
}

/// Outer `None`: truncated record. Inner `None`: not a session message.
fn read_data(cursor: &mut Cursor<'_>, def: &Definition) -> Option<Option<ActivitySummary>> {
    let mut sport = None;
    let mut elapsed = None;

    for &(num, size) in &def.fields {
        let bytes = cursor.take(size)?;
        if def.global != MESG_SESSION {
            continue;
        }
        match (num, size) {
            (FIELD_SPORT, 1) if bytes[0] != 0xFF => sport = Some(bytes[0]),
            (FIELD_TOTAL_ELAPSED_TIME, 4) => {
                let raw: [u8; 4] = bytes.try_into().ok()?;
                let value = if def.big_endian {
                    u32::from_be_bytes(raw)
                } else {
                    u32::from_le_bytes(raw)
                };
                if value != u32::MAX {
                    // Scale 1000: milliseconds
                    elapsed = Some(u64::from(value) / 1000);
                }
            }
            _ => {}
        }
    }
    cursor.take(def.developer_bytes)?;

    if def.global != MESG_SESSION {
        return Some(None);
    }
    Some(Some(ActivitySummary {
        sport: sport.map(sport_name).unwrap_or_else(|| "unknown".to_string()),
        duration_secs: elapsed,
    }))
}

fn sport_name(code: u8) -> String {
    match code {
        0 => "generic".to_string(),
        1 => "running".to_string(),
        2 => "cycling".to_string(),
        4 => "fitness equipment".to_string(),
        5 => "swimming".to_string(),
        10 => "training".to_string(),
        11 => "walking".to_string(),
        17 => "hiking".to_string(),
        other => format!("sport {other}"),
    }
}
