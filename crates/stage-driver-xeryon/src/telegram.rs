//! Telegram codec for the controller's ASCII telemetry stream.
//!
//! Protocol overview:
//! - Tokens are `KEY=value` or `A:KEY=value` (axis letter prefix on multi-axis
//!   controllers), separated by spaces, CR or LF.
//! - There is no framing byte. A token may be split across two reads, so the
//!   parser keeps an incomplete trailing token until the next read.
//! - Telemetry keys: `STAT` (status word), `EPOS` (encoder position),
//!   `TIME` (16-bit device tick counter).
//!
//! Tokens are routed to axes through a [`DispatchTable`] and grouped into
//! per-axis [`TelemetryFrame`]s, which the axis applies atomically.

use std::collections::HashMap;

/// Longest partial token carried between reads. Anything longer is noise.
const MAX_PENDING: usize = 64;

/// A parsed `[A:]KEY=value` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Axis letter prefix, if any
    pub letter: Option<char>,
    /// Mnemonic, upper case
    pub key: String,
    /// Integer payload
    pub value: i64,
}

/// Parse one token. Returns `None` for anything that is not `[A:]KEY=<integer>`.
pub fn parse_token(raw: &str) -> Option<Token> {
    let (lhs, rhs) = raw.trim().split_once('=')?;
    let (letter, key) = match lhs.split_once(':') {
        Some((l, k)) => {
            let mut chars = l.chars();
            let c = chars.next()?;
            if chars.next().is_some() || !c.is_ascii_alphabetic() {
                return None;
            }
            (Some(c.to_ascii_uppercase()), k)
        }
        None => (None, lhs),
    };
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let value = rhs.trim().parse::<i64>().ok()?;
    Some(Token {
        letter,
        key: key.to_ascii_uppercase(),
        value,
    })
}

/// Splits a byte stream into tokens, carrying partial tokens across reads.
#[derive(Debug, Default)]
pub struct TelegramParser {
    pending: String,
}

impl TelegramParser {
    /// New parser with no carried state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget any carried partial token.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Consume a read batch and return every complete, well-formed token.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Token> {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(&String::from_utf8_lossy(bytes));

        let is_delim = |c: char| c == ' ' || c == '\r' || c == '\n' || c == '\t';
        let complete_until = if text.ends_with(is_delim) {
            text.len()
        } else {
            text.rfind(is_delim).map_or(0, |i| i + 1)
        };

        let tail = &text[complete_until..];
        if tail.len() <= MAX_PENDING {
            self.pending = tail.to_string();
        } else {
            tracing::debug!(len = tail.len(), "dropping oversized partial token");
        }

        text[..complete_until]
            .split(is_delim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| {
                let token = parse_token(s);
                if token.is_none() {
                    tracing::trace!(token = s, "ignoring malformed token");
                }
                token
            })
            .collect()
    }
}

/// Telemetry keys the axis understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryKey {
    /// Status word
    Stat,
    /// Encoder position
    Epos,
    /// Device tick counter
    Time,
}

impl TelemetryKey {
    /// Every telemetry key.
    pub const ALL: [TelemetryKey; 3] = [TelemetryKey::Stat, TelemetryKey::Epos, TelemetryKey::Time];

    /// Map a mnemonic to a telemetry key.
    pub fn from_mnemonic(key: &str) -> Option<Self> {
        match key {
            "STAT" => Some(TelemetryKey::Stat),
            "EPOS" => Some(TelemetryKey::Epos),
            "TIME" => Some(TelemetryKey::Time),
            _ => None,
        }
    }
}

/// Maps `(axis letter, key)` to the index of the axis that consumes it.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    routes: HashMap<(Option<char>, TelemetryKey), usize>,
}

impl DispatchTable {
    /// Empty table; every token is unrouted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one key for one letter to an axis.
    pub fn insert(&mut self, letter: Option<char>, key: TelemetryKey, axis_index: usize) {
        self.routes.insert((letter, key), axis_index);
    }

    /// Table for a controller whose axes carry `letters`, in axis order.
    ///
    /// Prefixed tokens go to the axis with that letter. Unprefixed tokens go
    /// to the first axis when the controller has exactly one axis.
    pub fn for_letters(letters: &[Option<char>]) -> Self {
        let mut table = Self::new();
        for (index, letter) in letters.iter().enumerate() {
            for key in TelemetryKey::ALL {
                if let Some(c) = letter {
                    table.insert(Some(c.to_ascii_uppercase()), key, index);
                }
                if letters.len() == 1 {
                    table.insert(None, key, index);
                }
            }
        }
        table
    }

    /// Axis index and key for a token, if the token is routed.
    pub fn route(&self, token: &Token) -> Option<(usize, TelemetryKey)> {
        let key = TelemetryKey::from_mnemonic(&token.key)?;
        self.routes.get(&(token.letter, key)).map(|i| (*i, key))
    }
}

/// Telemetry fields reported together for one axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryFrame {
    /// `STAT`
    pub stat: Option<u32>,
    /// `EPOS`
    pub epos: Option<i64>,
    /// `TIME`
    pub time: Option<u16>,
}

impl TelemetryFrame {
    fn has(&self, key: TelemetryKey) -> bool {
        match key {
            TelemetryKey::Stat => self.stat.is_some(),
            TelemetryKey::Epos => self.epos.is_some(),
            TelemetryKey::Time => self.time.is_some(),
        }
    }

    /// Store `value` under `key`. Returns false for out-of-range values.
    fn store(&mut self, key: TelemetryKey, value: i64) -> bool {
        match key {
            TelemetryKey::Stat => u32::try_from(value).map(|v| self.stat = Some(v)).is_ok(),
            TelemetryKey::Epos => {
                self.epos = Some(value);
                true
            }
            TelemetryKey::Time => u16::try_from(value).map(|v| self.time = Some(v)).is_ok(),
        }
    }
}

/// Group a read batch into per-axis frames.
///
/// Tokens for the same axis accumulate into one frame until a key repeats,
/// which starts a new frame. Frames for one axis keep their arrival order.
pub fn group_frames(tokens: &[Token], table: &DispatchTable) -> Vec<(usize, TelemetryFrame)> {
    let mut done = Vec::new();
    let mut open: Vec<(usize, TelemetryFrame)> = Vec::new();

    for token in tokens {
        let Some((axis, key)) = table.route(token) else {
            continue;
        };
        let slot = match open.iter().position(|(a, _)| *a == axis) {
            Some(i) if open[i].1.has(key) => {
                done.push(open.remove(i));
                open.push((axis, TelemetryFrame::default()));
                open.len() - 1
            }
            Some(i) => i,
            None => {
                open.push((axis, TelemetryFrame::default()));
                open.len() - 1
            }
        };
        if !open[slot].1.store(key, token.value) {
            tracing::debug!(key = %token.key, value = token.value, "telemetry value out of range");
        }
    }

    done.extend(open.into_iter().filter(|(_, f)| *f != TelemetryFrame::default()));
    done
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_shapes() {
        assert_eq!(
            parse_token("EPOS=-1200"),
            Some(Token {
                letter: None,
                key: "EPOS".into(),
                value: -1200
            })
        );
        assert_eq!(parse_token("b:stat=7").unwrap().letter, Some('B'));
        assert!(parse_token("EPOS=").is_none());
        assert!(parse_token("LLIM=?").is_none());
        assert!(parse_token("garbage").is_none());
        assert!(parse_token("AB:EPOS=1").is_none());
        assert!(parse_token("EPOS=1.5").is_none());
    }

    #[test]
    fn test_token_split_across_reads() {
        let mut parser = TelegramParser::new();
        let first = parser.feed(b"STAT=1024 EP");
        assert_eq!(first.len(), 1);
        let second = parser.feed(b"OS=500 TIME=12\n");
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].key, "EPOS");
        assert_eq!(second[0].value, 500);
    }

    #[test]
    fn test_oversized_partial_dropped() {
        let mut parser = TelegramParser::new();
        let junk = vec![b'9'; MAX_PENDING + 10];
        assert!(parser.feed(&junk).is_empty());
        assert_eq!(parser.feed(b"EPOS=3\n").len(), 1);
    }

    #[test]
    fn test_single_axis_routing() {
        let table = DispatchTable::for_letters(&[None]);
        let mut parser = TelegramParser::new();
        let tokens = parser.feed(b"STAT=1 EPOS=5 SRNO=123 TIME=9\r\n");
        let frames = group_frames(&tokens, &table);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0],
            (
                0,
                TelemetryFrame {
                    stat: Some(1),
                    epos: Some(5),
                    time: Some(9)
                }
            )
        );
    }

    #[test]
    fn test_multi_axis_demux_and_repeated_keys() {
        let table = DispatchTable::for_letters(&[Some('X'), Some('Y')]);
        let mut parser = TelegramParser::new();
        let tokens = parser.feed(b"X:EPOS=1 Y:EPOS=2 X:STAT=3 X:EPOS=4 EPOS=99 Z:EPOS=5 ");
        let frames = group_frames(&tokens, &table);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].0, 0);
        assert_eq!(frames[0].1.epos, Some(1));
        assert_eq!(frames[0].1.stat, Some(3));
        // Y frame and the second X frame flushed in open order
        assert_eq!(frames[1], (1, TelemetryFrame { epos: Some(2), ..Default::default() }));
        assert_eq!(frames[2], (0, TelemetryFrame { epos: Some(4), ..Default::default() }));
    }

    #[test]
    fn test_time_out_of_range_ignored() {
        let table = DispatchTable::for_letters(&[None]);
        let tokens = vec![parse_token("TIME=70000").unwrap(), parse_token("EPOS=1").unwrap()];
        let frames = group_frames(&tokens, &table);
        assert_eq!(frames[0].1.time, None);
        assert_eq!(frames[0].1.epos, Some(1));
    }
}
