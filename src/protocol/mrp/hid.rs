/// Remote-control keys that can be synthesized as HID events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Up,
    Down,
    Left,
    Right,
    Select,
    Menu,
    Home,
    TopMenu,
    PlayPause,
    VolumeUp,
    VolumeDown,
    Sleep,
}

impl Key {
    /// The (usage-page, usage) pair this key maps to, per the fixed
    /// table in §4.9.
    #[must_use]
    pub fn usage(self) -> (u16, u16) {
        match self {
            Key::Up => (1, 0x8C),
            Key::Down => (1, 0x8D),
            Key::Left => (1, 0x8B),
            Key::Right => (1, 0x8A),
            Key::Select => (1, 0x89),
            Key::Menu => (1, 0x86),
            Key::Sleep => (1, 0x82),
            Key::Home => (12, 0x40),
            Key::TopMenu => (12, 0x60),
            Key::PlayPause => (12, 0xB0),
            Key::VolumeUp => (12, 0xE9),
            Key::VolumeDown => (12, 0xEA),
        }
    }
}

/// Opaque 8-byte timestamp, the same constant on every event. The source
/// protocol does not appear to validate it; see the HID timestamp open
/// question.
const TIMESTAMP: [u8; 8] = [0; 8];

/// Fixed 35-byte header constant preceding the usage-page/usage/pressed
/// fields in the HID event payload.
const HEADER: [u8; 35] = [0; 35];

/// Fixed 11-byte footer following the pressed flag.
const FOOTER: [u8; 11] = [0; 11];

const PAYLOAD_LEN: usize = 8 + 35 + 2 + 2 + 2 + 11;

/// Build the raw HID event payload for one key transition (down or up).
#[must_use]
pub fn hid_event_payload(key: Key, pressed: bool) -> [u8; PAYLOAD_LEN] {
    let (usage_page, usage) = key.usage();
    let mut payload = [0u8; PAYLOAD_LEN];
    let mut pos = 0;
    payload[pos..pos + 8].copy_from_slice(&TIMESTAMP);
    pos += 8;
    payload[pos..pos + 35].copy_from_slice(&HEADER);
    pos += 35;
    payload[pos..pos + 2].copy_from_slice(&usage_page.to_be_bytes());
    pos += 2;
    payload[pos..pos + 2].copy_from_slice(&usage.to_be_bytes());
    pos += 2;
    payload[pos..pos + 2].copy_from_slice(&(u16::from(pressed)).to_be_bytes());
    pos += 2;
    payload[pos..pos + 11].copy_from_slice(&FOOTER);
    payload
}

/// Minimum spacing between a key-down and key-up event for an ordinary
/// press.
pub const MIN_PRESS_GAP: std::time::Duration = std::time::Duration::from_millis(50);

/// Spacing used for long-press variants.
pub const LONG_PRESS_GAP: std::time::Duration = std::time::Duration::from_millis(1000);
