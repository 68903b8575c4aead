//! `STAT` status word decoding and info-bar messages.

use bitflags::bitflags;
use serde::Serialize;

bitflags! {
    /// Status word reported by the controller in `STAT=` telegrams (22 bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusBits: u32 {
        /// Amplifiers enabled
        const AMPLIFIERS_ENABLED = 1 << 0;
        /// End stop reached
        const END_STOP = 1 << 1;
        /// Thermal protection 1 tripped
        const THERMAL_PROTECTION_1 = 1 << 2;
        /// Thermal protection 2 tripped
        const THERMAL_PROTECTION_2 = 1 << 3;
        /// Force zero active
        const FORCE_ZERO = 1 << 4;
        /// Motor on
        const MOTOR_ON = 1 << 5;
        /// Closed loop control active
        const CLOSED_LOOP = 1 << 6;
        /// Encoder at index
        const ENCODER_AT_INDEX = 1 << 7;
        /// Encoder valid (index found)
        const ENCODER_VALID = 1 << 8;
        /// Searching index
        const SEARCHING_INDEX = 1 << 9;
        /// Position reached
        const POSITION_REACHED = 1 << 10;
        /// Error compensation active
        const ERROR_COMPENSATION = 1 << 11;
        /// Encoder error
        const ENCODER_ERROR = 1 << 12;
        /// Scanning
        const SCANNING = 1 << 13;
        /// Left end stop
        const LEFT_END_STOP = 1 << 14;
        /// Right end stop
        const RIGHT_END_STOP = 1 << 15;
        /// Following error limit exceeded
        const ERROR_LIMIT = 1 << 16;
        /// Searching optimal frequency
        const SEARCHING_OPTIMAL_FREQUENCY = 1 << 17;
        /// Safety timeout triggered
        const SAFETY_TIMEOUT = 1 << 18;
        /// EtherCAT acknowledge
        const ETHERCAT_ACK = 1 << 19;
        /// Emergency stop
        const EMERGENCY_STOP = 1 << 20;
        /// Position fail
        const POSITION_FAIL = 1 << 21;
    }
}

/// Decoded status word, one field per bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusFlags {
    /// Bit 0
    pub amplifiers_enabled: bool,
    /// Bit 1
    pub end_stop: bool,
    /// Bit 2
    pub thermal_protection_1: bool,
    /// Bit 3
    pub thermal_protection_2: bool,
    /// Bit 4
    pub force_zero: bool,
    /// Bit 5
    pub motor_on: bool,
    /// Bit 6
    pub closed_loop: bool,
    /// Bit 7
    pub encoder_at_index: bool,
    /// Bit 8
    pub encoder_valid: bool,
    /// Bit 9
    pub searching_index: bool,
    /// Bit 10, raw. The axis gates it with the tolerance check.
    pub position_reached: bool,
    /// Bit 11
    pub error_compensation: bool,
    /// Bit 12
    pub encoder_error: bool,
    /// Bit 13
    pub scanning: bool,
    /// Bit 14
    pub left_end_stop: bool,
    /// Bit 15
    pub right_end_stop: bool,
    /// Bit 16
    pub error_limit: bool,
    /// Bit 17
    pub searching_optimal_frequency: bool,
    /// Bit 18
    pub safety_timeout: bool,
    /// Bit 19
    pub ethercat_ack: bool,
    /// Bit 20
    pub emergency_stop: bool,
    /// Bit 21
    pub position_fail: bool,
}

impl StatusFlags {
    /// Decode a raw `STAT` value. Bits above 21 are ignored.
    pub fn decode(stat: u32) -> Self {
        let b = StatusBits::from_bits_truncate(stat);
        Self {
            amplifiers_enabled: b.contains(StatusBits::AMPLIFIERS_ENABLED),
            end_stop: b.contains(StatusBits::END_STOP),
            thermal_protection_1: b.contains(StatusBits::THERMAL_PROTECTION_1),
            thermal_protection_2: b.contains(StatusBits::THERMAL_PROTECTION_2),
            force_zero: b.contains(StatusBits::FORCE_ZERO),
            motor_on: b.contains(StatusBits::MOTOR_ON),
            closed_loop: b.contains(StatusBits::CLOSED_LOOP),
            encoder_at_index: b.contains(StatusBits::ENCODER_AT_INDEX),
            encoder_valid: b.contains(StatusBits::ENCODER_VALID),
            searching_index: b.contains(StatusBits::SEARCHING_INDEX),
            position_reached: b.contains(StatusBits::POSITION_REACHED),
            error_compensation: b.contains(StatusBits::ERROR_COMPENSATION),
            encoder_error: b.contains(StatusBits::ENCODER_ERROR),
            scanning: b.contains(StatusBits::SCANNING),
            left_end_stop: b.contains(StatusBits::LEFT_END_STOP),
            right_end_stop: b.contains(StatusBits::RIGHT_END_STOP),
            error_limit: b.contains(StatusBits::ERROR_LIMIT),
            searching_optimal_frequency: b.contains(StatusBits::SEARCHING_OPTIMAL_FREQUENCY),
            safety_timeout: b.contains(StatusBits::SAFETY_TIMEOUT),
            ethercat_ack: b.contains(StatusBits::ETHERCAT_ACK),
            emergency_stop: b.contains(StatusBits::EMERGENCY_STOP),
            position_fail: b.contains(StatusBits::POSITION_FAIL),
        }
    }
}

/// Severity of an info-bar message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    /// Informational
    Informational,
    /// Needs attention
    Warning,
    /// Motion is impaired
    Error,
}

/// A condition the host should surface to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfoMessage {
    /// Severity
    pub severity: Severity,
    /// Short title
    pub title: &'static str,
    /// Explanation
    pub message: &'static str,
}

const THERMAL: InfoMessage = InfoMessage {
    severity: Severity::Error,
    title: "Thermal protection",
    message: "The stage overheated and the amplifiers were switched off. Let it cool down before moving again.",
};

const ERROR_LIMIT: InfoMessage = InfoMessage {
    severity: Severity::Error,
    title: "Error limit",
    message: "The following error exceeded ELIM. Check for obstructions or reduce speed.",
};

const ENCODER_ERROR: InfoMessage = InfoMessage {
    severity: Severity::Error,
    title: "Encoder error",
    message: "The encoder reported an error. Reset the encoder and search the index again.",
};

const SAFETY_TIMEOUT: InfoMessage = InfoMessage {
    severity: Severity::Warning,
    title: "Safety timeout",
    message: "The stage did not reach its target in time and the motor was switched off.",
};

const POSITION_FAIL: InfoMessage = InfoMessage {
    severity: Severity::Warning,
    title: "Position fail",
    message: "The stage could not hold the requested position within tolerance.",
};

const EMERGENCY_STOP: InfoMessage = InfoMessage {
    severity: Severity::Error,
    title: "Emergency stop",
    message: "The emergency stop input is active. Release it to resume.",
};

/// Messages for every active fault condition, most severe first.
pub fn info_messages(flags: &StatusFlags) -> Vec<InfoMessage> {
    let mut messages = Vec::new();
    if flags.emergency_stop {
        messages.push(EMERGENCY_STOP);
    }
    if flags.thermal_protection_1 || flags.thermal_protection_2 {
        messages.push(THERMAL);
    }
    if flags.error_limit {
        messages.push(ERROR_LIMIT);
    }
    if flags.encoder_error {
        messages.push(ENCODER_ERROR);
    }
    if flags.safety_timeout {
        messages.push(SAFETY_TIMEOUT);
    }
    if flags.position_fail {
        messages.push(POSITION_FAIL);
    }
    messages.sort_by(|a, b| b.severity.cmp(&a.severity));
    messages
}
