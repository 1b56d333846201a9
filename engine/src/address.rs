use serde::{Deserialize, Serialize};
use std::fmt;

/// Element index addressing the whole device rather than one channel.
pub const ELEMENT_MAIN: u32 = 0;

/// HAL sentinel meaning "every element of the scope".
pub const ELEMENT_WILDCARD: u32 = 0xFFFF_FFFF;

/// Build a HAL four-char code (`b"volm"` -> `0x766F6C6D`).
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | code[3] as u32
}

/// Render a code as its four characters when printable, hex otherwise.
pub fn fourcc_str(code: u32) -> String {
    let bytes = code.to_be_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        bytes.iter().map(|b| *b as char).collect()
    } else {
        format!("{code:#010X}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// `kAudioObjectUnknown`. Never sent to the provider.
    pub const UNKNOWN: DeviceId = DeviceId(0);

    /// `kAudioObjectSystemObject`, owner of the global properties.
    pub const SYSTEM: DeviceId = DeviceId(1);

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for DeviceId {
    fn from(value: u32) -> Self {
        DeviceId(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Input,
    Output,
    PlayThrough,
}

impl Scope {
    pub const ALL: [Scope; 4] = [Scope::Global, Scope::Input, Scope::Output, Scope::PlayThrough];

    pub const fn code(self) -> u32 {
        match self {
            Scope::Global => fourcc(b"glob"),
            Scope::Input => fourcc(b"inpt"),
            Scope::Output => fourcc(b"outp"),
            Scope::PlayThrough => fourcc(b"ptru"),
        }
    }

    pub fn from_code(code: u32) -> Option<Scope> {
        Self::ALL.into_iter().find(|scope| scope.code() == code)
    }

    pub fn parse(name: &str) -> Option<Scope> {
        match name.trim().to_ascii_lowercase().as_str() {
            "global" | "glob" => Some(Scope::Global),
            "input" | "inpt" | "in" => Some(Scope::Input),
            "output" | "outp" | "out" => Some(Scope::Output),
            "playthrough" | "ptru" => Some(Scope::PlayThrough),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Global => "global",
            Scope::Input => "input",
            Scope::Output => "output",
            Scope::PlayThrough => "playthrough",
        };
        f.write_str(name)
    }
}

/// A (selector, scope, element) triple naming one property of a HAL object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyAddress {
    pub selector: u32,
    pub scope: Scope,
    pub element: u32,
}

impl PropertyAddress {
    pub const fn new(selector: u32, scope: Scope) -> Self {
        Self {
            selector,
            scope,
            element: ELEMENT_MAIN,
        }
    }

    pub const fn with_element(self, element: u32) -> Self {
        Self {
            selector: self.selector,
            scope: self.scope,
            element,
        }
    }

    pub const fn is_wildcard_element(&self) -> bool {
        self.element == ELEMENT_WILDCARD
    }

    pub const fn is_main_element(&self) -> bool {
        self.element == ELEMENT_MAIN
    }
}

impl fmt::Display for PropertyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard_element() {
            write!(f, "'{}'/{}/*", fourcc_str(self.selector), self.scope)
        } else {
            write!(
                f,
                "'{}'/{}/{}",
                fourcc_str(self.selector),
                self.scope,
                self.element
            )
        }
    }
}
