/// Media commands carried in a `SendCommand` envelope's `command` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
    Play = 1,
    Pause = 2,
    TogglePlayPause = 3,
    Stop = 4,
    NextTrack = 5,
    PreviousTrack = 6,
    SkipForward = 18,
    SkipBackward = 19,
}
