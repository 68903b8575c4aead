//! Axis identification at discovery time.
//!
//! The controller dumps a line such as `X:XLS1=313` for every axis. The model
//! prefix selects an [`AxisFamily`]; the number is the resolution the
//! firmware reports, which for some families is rounded and must be mapped
//! to the true value through the family's correction table.
//!
//! [`AxisIdentifier`] then queries `LLIM` and `HLIM` to compute the travel
//! range. A failed query leaves that limit at 0.

use regex::Regex;
use serde::Serialize;
use stage_core::error::{AppResult, StageError};
use std::fmt;
use std::sync::LazyLock;
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::query::QueryLink;
use crate::units::AxisKind;

static DEVICE_INFO_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\b([A-Z]):)?\b(X[A-Z]+[0-9]*)=([0-9]+(?:\.[0-9]+)?)")
        .expect("Invalid device info regex")
});

/// Stage family, derived from the model prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AxisFamily {
    /// Linear stage
    Xls,
    /// Rotation stage
    Xrt,
    /// Rotation stage, third generation
    Xrt3,
    /// Linear actuator
    Xla,
    /// Rotation stage, actuator variant
    Xrta,
}

/// `(reported, actual)` resolution pairs.
type CorrectionTable = &'static [(f64, f64)];

const XLS_CORRECTIONS: CorrectionTable = &[
    (311.0, 312.5),
    (313.0, 312.5),
    (1249.0, 1250.0),
    (1251.0, 1250.0),
    (77.0, 78.125),
    (79.0, 78.125),
];

const XRT_CORRECTIONS: CorrectionTable = &[(4.0, 3.0), (20.0, 19.0), (50.0, 49.0), (110.0, 109.0)];

const XRT3_CORRECTIONS: CorrectionTable = &[(2.0, 3.0), (48.0, 49.0), (108.0, 109.0)];

impl AxisFamily {
    /// Every family, in prefix-matching order (longest prefixes first).
    pub const ALL: [AxisFamily; 5] = [
        AxisFamily::Xrta,
        AxisFamily::Xrt3,
        AxisFamily::Xrt,
        AxisFamily::Xla,
        AxisFamily::Xls,
    ];

    /// Model prefix of this family.
    pub fn prefix(self) -> &'static str {
        match self {
            AxisFamily::Xls => "XLS",
            AxisFamily::Xrt => "XRT",
            AxisFamily::Xrt3 => "XRT3",
            AxisFamily::Xla => "XLA",
            AxisFamily::Xrta => "XRTA",
        }
    }

    /// Family of a model string such as `XLS1` or `XRTA-2`.
    pub fn from_model(model: &str) -> AppResult<Self> {
        let upper = model.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|f| upper.starts_with(f.prefix()))
            .ok_or_else(|| StageError::UnknownAxisFamily(model.to_string()))
    }

    /// Linear or rotary.
    pub fn kind(self) -> AxisKind {
        match self {
            AxisFamily::Xls | AxisFamily::Xla => AxisKind::Linear,
            AxisFamily::Xrt | AxisFamily::Xrt3 | AxisFamily::Xrta => AxisKind::Rotary,
        }
    }

    fn corrections(self) -> CorrectionTable {
        match self {
            AxisFamily::Xls => XLS_CORRECTIONS,
            AxisFamily::Xrt => XRT_CORRECTIONS,
            AxisFamily::Xrt3 => XRT3_CORRECTIONS,
            AxisFamily::Xla | AxisFamily::Xrta => &[],
        }
    }

    /// Map a reported resolution to the true one. Unlisted values pass through.
    pub fn adjust_resolution(self, reported: f64) -> f64 {
        self.corrections()
            .iter()
            .find(|(r, _)| *r == reported)
            .map_or(reported, |(_, actual)| *actual)
    }
}

impl fmt::Display for AxisFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Check every correction table: positive finite entries and no reported
/// value listed twice.
pub fn validate_tables() -> AppResult<()> {
    for family in AxisFamily::ALL {
        let table = family.corrections();
        for (i, (reported, actual)) in table.iter().enumerate() {
            if !(reported.is_finite() && *reported > 0.0 && actual.is_finite() && *actual > 0.0) {
                return Err(StageError::Configuration(format!(
                    "{} correction ({}, {}) is not a positive resolution",
                    family, reported, actual
                )));
            }
            if table[..i].iter().any(|(r, _)| r == reported) {
                return Err(StageError::Configuration(format!(
                    "{} correction table lists {} twice",
                    family, reported
                )));
            }
        }
    }
    Ok(())
}

/// One `[A:]MODEL=resolution` entry found in a discovery dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Axis letter, if prefixed
    pub letter: Option<char>,
    /// Model key, e.g. `XLS1`
    pub model: String,
    /// Resolution as reported by the firmware
    pub reported_resolution: f64,
}

/// Extract every device-info entry from a captured dump, in order.
pub fn parse_device_info(dump: &str) -> Vec<DeviceInfo> {
    DEVICE_INFO_REGEX
        .captures_iter(dump)
        .filter_map(|caps| {
            let model = caps.get(2)?.as_str().to_string();
            let reported_resolution = caps.get(3)?.as_str().parse().ok()?;
            Some(DeviceInfo {
                letter: caps.get(1).and_then(|m| m.as_str().chars().next()),
                model,
                reported_resolution,
            })
        })
        .collect()
}

/// Result of identifying one axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisIdentification {
    /// Axis letter (None on single-axis controllers)
    pub letter: Option<char>,
    /// Model key
    pub model: String,
    /// Family
    pub family: AxisFamily,
    /// Resolution after correction (nm/count or µrad/count)
    pub resolution: f64,
    /// Low limit in counts (0 if the query failed)
    pub llim: i64,
    /// High limit in counts (0 if the query failed)
    pub hlim: i64,
    /// `(hlim - llim) * resolution / 1e6` (mm, or rad for rotary stages)
    pub range: f64,
}

/// Runs the LLIM/HLIM exchange for one axis.
pub struct AxisIdentifier<'a, R, W> {
    link: QueryLink<'a, R, W>,
}

impl<'a, R, W> AxisIdentifier<'a, R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Identifier over an exclusively borrowed query link.
    pub fn new(link: QueryLink<'a, R, W>) -> Self {
        Self { link }
    }

    /// Identify the axis described by `info`.
    ///
    /// Fails only for unknown families. Limit queries that time out are
    /// logged and leave the limit at 0.
    pub async fn identify(&mut self, info: &DeviceInfo) -> AppResult<AxisIdentification> {
        let family = AxisFamily::from_model(&info.model)?;
        let resolution = family.adjust_resolution(info.reported_resolution);

        let llim = self.limit("LLIM", info.letter).await;
        let hlim = self.limit("HLIM", info.letter).await;

        Ok(AxisIdentification {
            letter: info.letter,
            model: info.model.clone(),
            family,
            resolution,
            llim,
            hlim,
            range: (hlim - llim) as f64 * resolution / 1e6,
        })
    }

    async fn limit(&mut self, mnemonic: &str, letter: Option<char>) -> i64 {
        match self.link.query(mnemonic, letter).await {
            Ok(v) => v.round() as i64,
            Err(e) => {
                tracing::warn!(mnemonic, ?letter, error = %e, "limit query failed");
                0
            }
        }
    }

    /// Give the link back.
    pub fn into_link(self) -> QueryLink<'a, R, W> {
        self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};

    #[test]
    fn test_family_from_model() {
        assert_eq!(AxisFamily::from_model("XLS1").unwrap(), AxisFamily::Xls);
        assert_eq!(AxisFamily::from_model("xrt3-2").unwrap(), AxisFamily::Xrt3);
        assert_eq!(AxisFamily::from_model("XRTA").unwrap(), AxisFamily::Xrta);
        assert_eq!(AxisFamily::from_model("XRT1").unwrap(), AxisFamily::Xrt);
        assert!(matches!(
            AxisFamily::from_model("ABC1"),
            Err(StageError::UnknownAxisFamily(_))
        ));
    }

    #[test]
    fn test_resolution_correction() {
        assert_eq!(AxisFamily::Xls.adjust_resolution(313.0), 312.5);
        assert_eq!(AxisFamily::Xls.adjust_resolution(1251.0), 1250.0);
        assert_eq!(AxisFamily::Xls.adjust_resolution(5.0), 5.0);
        assert_eq!(AxisFamily::Xrt3.adjust_resolution(48.0), 49.0);
        assert_eq!(AxisFamily::Xla.adjust_resolution(313.0), 313.0);
        assert_eq!(AxisFamily::Xrta.adjust_resolution(4.0), 4.0);
        validate_tables().unwrap();
    }

    #[test]
    fn test_parse_device_info() {
        let dump = "SRNO=1234\nSOFT=2.1\nX:XLS1=313\nY:XRT3=48 STAT=0\nAXES=2\n";
        let infos = parse_device_info(dump);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].letter, Some('X'));
        assert_eq!(infos[0].model, "XLS1");
        assert_eq!(infos[0].reported_resolution, 313.0);
        assert_eq!(infos[1].model, "XRT3");

        let single = parse_device_info("XLA3=1250\n");
        assert_eq!(single[0].letter, None);
    }

    #[tokio::test]
    async fn test_identify_with_partial_failure() {
        let (mut device, host) = tokio::io::duplex(256);
        let (read, mut write) = tokio::io::split(host);
        let mut reader = BufReader::new(read);

        // Only LLIM is answered
        device.write_all(b"LLIM=-16000\n").await.unwrap();

        let link = QueryLink::new(&mut reader, &mut write).with_timeout(Duration::from_millis(50));
        let mut identifier = AxisIdentifier::new(link);
        let info = DeviceInfo {
            letter: None,
            model: "XLS1".into(),
            reported_resolution: 313.0,
        };
        let id = identifier.identify(&info).await.unwrap();
        assert_eq!(id.resolution, 312.5);
        assert_eq!(id.llim, -16000);
        assert_eq!(id.hlim, 0);
        assert_eq!(id.range, 5.0);
    }
}
