//! Typed command constructors for the text SDK.
//!
//! Every verb the device understands is a [`Verb`] variant, and every
//! [`Command`] is built through a constructor that validates its arguments
//! against the ranges the device accepts. A malformed command fails here with
//! [`Error::InvalidParameter`] instead of costing a round-trip to the device.
//!
//! Constructors are pure: they perform no I/O. The command channel turns a
//! [`Command`] into bytes with [`Command::to_wire`].
//!
//! # Wire grammar
//!
//! `<verb> [arg ...]`, ASCII, arguments separated by single spaces, no
//! terminator. Distances are centimetres, angles degrees, speeds cm/s.

use std::fmt;
use std::ops::RangeInclusive;

use tokio::time::Instant;

use tello_core::{CommandKind, Error, Result};

/// Accepted range for `up`/`down`/`left`/`right`/`forward`/`back`, in cm.
pub const DISTANCE_RANGE: RangeInclusive<i32> = 20..=500;
/// Accepted range for `cw`/`ccw`, in degrees.
pub const ROTATION_RANGE: RangeInclusive<i32> = 1..=360;
/// Accepted range for `go`/`curve`/`jump` coordinates, in cm.
pub const COORDINATE_RANGE: RangeInclusive<i32> = -500..=500;
/// Accepted range for `go`/`jump`/`speed`, in cm/s.
pub const SPEED_RANGE: RangeInclusive<i32> = 10..=100;
/// Accepted range for `curve` speed, in cm/s.
pub const CURVE_SPEED_RANGE: RangeInclusive<i32> = 10..=60;
/// Accepted range for each `rc` channel.
pub const RC_RANGE: RangeInclusive<i32> = -100..=100;

// ---------------------------------------------------------------
// Verbs
// ---------------------------------------------------------------

/// The closed set of command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Enter SDK mode. The mandatory handshake, also used as keepalive.
    Command,
    Takeoff,
    Land,
    /// Cut the motors immediately.
    Emergency,
    /// Hover in place.
    Stop,
    StreamOn,
    StreamOff,
    Up,
    Down,
    Left,
    Right,
    Forward,
    Back,
    /// Rotate clockwise.
    Cw,
    /// Rotate counter-clockwise.
    Ccw,
    Flip,
    Go,
    Curve,
    Jump,
    Speed,
    Rc,
    Wifi,
    Ap,
    /// Enable mission pad detection.
    Mon,
    /// Disable mission pad detection.
    Moff,
    MDirection,
    ReadSpeed,
    ReadBattery,
    ReadTime,
    ReadWifi,
    ReadSdk,
    ReadSn,
}

impl Verb {
    /// The verb's exact wire spelling.
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Command => "command",
            Verb::Takeoff => "takeoff",
            Verb::Land => "land",
            Verb::Emergency => "emergency",
            Verb::Stop => "stop",
            Verb::StreamOn => "streamon",
            Verb::StreamOff => "streamoff",
            Verb::Up => "up",
            Verb::Down => "down",
            Verb::Left => "left",
            Verb::Right => "right",
            Verb::Forward => "forward",
            Verb::Back => "back",
            Verb::Cw => "cw",
            Verb::Ccw => "ccw",
            Verb::Flip => "flip",
            Verb::Go => "go",
            Verb::Curve => "curve",
            Verb::Jump => "jump",
            Verb::Speed => "speed",
            Verb::Rc => "rc",
            Verb::Wifi => "wifi",
            Verb::Ap => "ap",
            Verb::Mon => "mon",
            Verb::Moff => "moff",
            Verb::MDirection => "mdirection",
            Verb::ReadSpeed => "speed?",
            Verb::ReadBattery => "battery?",
            Verb::ReadTime => "time?",
            Verb::ReadWifi => "wifi?",
            Verb::ReadSdk => "sdk?",
            Verb::ReadSn => "sn?",
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Verb::Speed
            | Verb::Rc
            | Verb::Wifi
            | Verb::Ap
            | Verb::Mon
            | Verb::Moff
            | Verb::MDirection => CommandKind::Set,
            Verb::ReadSpeed
            | Verb::ReadBattery
            | Verb::ReadTime
            | Verb::ReadWifi
            | Verb::ReadSdk
            | Verb::ReadSn => CommandKind::Read,
            _ => CommandKind::Control,
        }
    }

    /// Whether the verb is only meaningful while airborne.
    ///
    /// `emergency` is deliberately absent: it must always reach the device.
    pub fn requires_flight(&self) -> bool {
        matches!(
            self,
            Verb::Land
                | Verb::Stop
                | Verb::Up
                | Verb::Down
                | Verb::Left
                | Verb::Right
                | Verb::Forward
                | Verb::Back
                | Verb::Cw
                | Verb::Ccw
                | Verb::Flip
                | Verb::Go
                | Verb::Curve
                | Verb::Jump
        )
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------

/// One primitive command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Int(i32),
    Word(String),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(n) => write!(f, "{n}"),
            Arg::Word(w) => f.write_str(w),
        }
    }
}

/// Direction argument of `flip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipDirection {
    Left,
    Right,
    Forward,
    Back,
}

impl FlipDirection {
    fn code(&self) -> &'static str {
        match self {
            FlipDirection::Left => "l",
            FlipDirection::Right => "r",
            FlipDirection::Forward => "f",
            FlipDirection::Back => "b",
        }
    }
}

/// A mission pad identifier, `m1` through `m8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MissionPad(u8);

impl MissionPad {
    pub fn new(id: u8) -> Result<Self> {
        if (1..=8).contains(&id) {
            Ok(MissionPad(id))
        } else {
            Err(Error::InvalidParameter(format!(
                "mission pad {id} out of range m1..m8"
            )))
        }
    }

    pub fn id(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for MissionPad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Mission pad detection direction for `mdirection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadDirection {
    Downward = 0,
    Forward = 1,
    Both = 2,
}

// ---------------------------------------------------------------
// Command
// ---------------------------------------------------------------

/// A validated, immutable command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    verb: Verb,
    args: Vec<Arg>,
    issued_at: Instant,
}

fn check(what: &str, value: i32, range: &RangeInclusive<i32>) -> Result<Arg> {
    if range.contains(&value) {
        Ok(Arg::Int(value))
    } else {
        Err(Error::InvalidParameter(format!(
            "{what} {value} out of range {}..={}",
            range.start(),
            range.end()
        )))
    }
}

fn check_xyz(x: i32, y: i32, z: i32) -> Result<Vec<Arg>> {
    let args = vec![
        check("x", x, &COORDINATE_RANGE)?,
        check("y", y, &COORDINATE_RANGE)?,
        check("z", z, &COORDINATE_RANGE)?,
    ];
    // The device refuses a target inside its own 20 cm box.
    if [x, y, z].iter().all(|c| (-20..=20).contains(c)) {
        return Err(Error::InvalidParameter(format!(
            "target ({x}, {y}, {z}) within 20 cm on every axis"
        )));
    }
    Ok(args)
}

fn check_word(what: &str, value: &str) -> Result<Arg> {
    if value.is_empty() || value.chars().any(|c| c.is_whitespace() || !c.is_ascii()) {
        Err(Error::InvalidParameter(format!(
            "{what} must be non-empty ASCII without spaces"
        )))
    } else {
        Ok(Arg::Word(value.to_string()))
    }
}

impl Command {
    fn with_args(verb: Verb, args: Vec<Arg>) -> Self {
        Command {
            verb,
            args,
            issued_at: Instant::now(),
        }
    }

    fn bare(verb: Verb) -> Self {
        Command::with_args(verb, Vec::new())
    }

    fn distance(verb: Verb, cm: i32) -> Result<Self> {
        let arg = check(verb.name(), cm, &DISTANCE_RANGE)?;
        Ok(Command::with_args(verb, vec![arg]))
    }

    fn rotation(verb: Verb, degrees: i32) -> Result<Self> {
        let arg = check(verb.name(), degrees, &ROTATION_RANGE)?;
        Ok(Command::with_args(verb, vec![arg]))
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn name(&self) -> &'static str {
        self.verb.name()
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn kind(&self) -> CommandKind {
        self.verb.kind()
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    /// The exact bytes sent to the device.
    pub fn to_wire(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    // -- control ------------------------------------------------------

    /// `command`: enter SDK mode.
    pub fn command() -> Self {
        Command::bare(Verb::Command)
    }

    pub fn takeoff() -> Self {
        Command::bare(Verb::Takeoff)
    }

    pub fn land() -> Self {
        Command::bare(Verb::Land)
    }

    pub fn emergency() -> Self {
        Command::bare(Verb::Emergency)
    }

    pub fn stop() -> Self {
        Command::bare(Verb::Stop)
    }

    pub fn stream_on() -> Self {
        Command::bare(Verb::StreamOn)
    }

    pub fn stream_off() -> Self {
        Command::bare(Verb::StreamOff)
    }

    pub fn up(cm: i32) -> Result<Self> {
        Command::distance(Verb::Up, cm)
    }

    pub fn down(cm: i32) -> Result<Self> {
        Command::distance(Verb::Down, cm)
    }

    pub fn left(cm: i32) -> Result<Self> {
        Command::distance(Verb::Left, cm)
    }

    pub fn right(cm: i32) -> Result<Self> {
        Command::distance(Verb::Right, cm)
    }

    pub fn forward(cm: i32) -> Result<Self> {
        Command::distance(Verb::Forward, cm)
    }

    pub fn back(cm: i32) -> Result<Self> {
        Command::distance(Verb::Back, cm)
    }

    pub fn cw(degrees: i32) -> Result<Self> {
        Command::rotation(Verb::Cw, degrees)
    }

    pub fn ccw(degrees: i32) -> Result<Self> {
        Command::rotation(Verb::Ccw, degrees)
    }

    pub fn flip(direction: FlipDirection) -> Self {
        Command::with_args(Verb::Flip, vec![Arg::Word(direction.code().into())])
    }

    /// `go x y z speed`: fly to a point relative to the current position.
    pub fn go(x: i32, y: i32, z: i32, speed: i32) -> Result<Self> {
        let mut args = check_xyz(x, y, z)?;
        args.push(check("speed", speed, &SPEED_RANGE)?);
        Ok(Command::with_args(Verb::Go, args))
    }

    /// `go x y z speed mid`: fly to a point relative to a mission pad.
    pub fn go_mission_pad(x: i32, y: i32, z: i32, speed: i32, pad: MissionPad) -> Result<Self> {
        let mut cmd = Command::go(x, y, z, speed)?;
        cmd.args.push(Arg::Word(pad.to_string()));
        Ok(cmd)
    }

    /// `curve x1 y1 z1 x2 y2 z2 speed`: fly an arc through two points.
    pub fn curve(from: (i32, i32, i32), to: (i32, i32, i32), speed: i32) -> Result<Self> {
        let mut args = vec![
            check("x1", from.0, &COORDINATE_RANGE)?,
            check("y1", from.1, &COORDINATE_RANGE)?,
            check("z1", from.2, &COORDINATE_RANGE)?,
            check("x2", to.0, &COORDINATE_RANGE)?,
            check("y2", to.1, &COORDINATE_RANGE)?,
            check("z2", to.2, &COORDINATE_RANGE)?,
        ];
        args.push(check("curve speed", speed, &CURVE_SPEED_RANGE)?);
        Ok(Command::with_args(Verb::Curve, args))
    }

    pub fn curve_mission_pad(
        from: (i32, i32, i32),
        to: (i32, i32, i32),
        speed: i32,
        pad: MissionPad,
    ) -> Result<Self> {
        let mut cmd = Command::curve(from, to, speed)?;
        cmd.args.push(Arg::Word(pad.to_string()));
        Ok(cmd)
    }

    /// `jump x y z speed yaw mid1 mid2`: fly to a point relative to `from`,
    /// then align with `to` and turn to `yaw`.
    pub fn jump(
        target: (i32, i32, i32),
        speed: i32,
        yaw: i32,
        from: MissionPad,
        to: MissionPad,
    ) -> Result<Self> {
        let mut args = check_xyz(target.0, target.1, target.2)?;
        args.push(check("speed", speed, &SPEED_RANGE)?);
        args.push(check("yaw", yaw, &ROTATION_RANGE)?);
        args.push(Arg::Word(from.to_string()));
        args.push(Arg::Word(to.to_string()));
        Ok(Command::with_args(Verb::Jump, args))
    }

    // -- set ----------------------------------------------------------

    pub fn set_speed(cm_per_s: i32) -> Result<Self> {
        let arg = check("speed", cm_per_s, &SPEED_RANGE)?;
        Ok(Command::with_args(Verb::Speed, vec![arg]))
    }

    /// `rc a b c d`: remote-control stick values (left/right, forward/back,
    /// up/down, yaw).
    pub fn rc(left_right: i32, forward_back: i32, up_down: i32, yaw: i32) -> Result<Self> {
        let args = vec![
            check("rc left/right", left_right, &RC_RANGE)?,
            check("rc forward/back", forward_back, &RC_RANGE)?,
            check("rc up/down", up_down, &RC_RANGE)?,
            check("rc yaw", yaw, &RC_RANGE)?,
        ];
        Ok(Command::with_args(Verb::Rc, args))
    }

    /// `wifi ssid pass`: rename the device's own access point.
    pub fn set_wifi(ssid: &str, password: &str) -> Result<Self> {
        let args = vec![check_word("ssid", ssid)?, check_word("password", password)?];
        Ok(Command::with_args(Verb::Wifi, args))
    }

    /// `ap ssid pass`: join an existing access point (station mode).
    pub fn join_access_point(ssid: &str, password: &str) -> Result<Self> {
        let args = vec![check_word("ssid", ssid)?, check_word("password", password)?];
        Ok(Command::with_args(Verb::Ap, args))
    }

    pub fn mission_pads_on() -> Self {
        Command::bare(Verb::Mon)
    }

    pub fn mission_pads_off() -> Self {
        Command::bare(Verb::Moff)
    }

    pub fn mission_pad_direction(direction: PadDirection) -> Self {
        Command::with_args(Verb::MDirection, vec![Arg::Int(direction as i32)])
    }

    // -- read ---------------------------------------------------------

    pub fn read_speed() -> Self {
        Command::bare(Verb::ReadSpeed)
    }

    pub fn read_battery() -> Self {
        Command::bare(Verb::ReadBattery)
    }

    pub fn read_time() -> Self {
        Command::bare(Verb::ReadTime)
    }

    pub fn read_wifi() -> Self {
        Command::bare(Verb::ReadWifi)
    }

    pub fn read_sdk() -> Self {
        Command::bare(Verb::ReadSdk)
    }

    pub fn read_serial_number() -> Self {
        Command::bare(Verb::ReadSn)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb.name())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
