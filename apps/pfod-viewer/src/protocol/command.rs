use std::fmt;

/// Asks the device for its main menu; sent first on connect.
pub const MAIN_MENU_COMMAND: &str = "{.}";

/// `{name}` for a full snapshot, `{version:name}` for an update against a
/// version the client already holds.
pub fn drawing_request(name: &str, version: Option<&str>) -> String {
    match version {
        Some(version) if !version.is_empty() => format!("{{{version}:{name}}}"),
        _ => format!("{{{name}}}"),
    }
}

/// Touch filter codes understood by pfod devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TouchFilter {
    Touch,
    Down,
    Drag,
    Up,
    Click,
    Press,
    Entry,
    Exit,
    DownUp,
}

impl TouchFilter {
    pub const fn code(self) -> u16 {
        match self {
            TouchFilter::Touch => 0,
            TouchFilter::Down => 1,
            TouchFilter::Drag => 2,
            TouchFilter::Up => 4,
            TouchFilter::Click => 8,
            TouchFilter::Press => 16,
            TouchFilter::Entry => 32,
            TouchFilter::Exit => 64,
            TouchFilter::DownUp => 256,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let filter = match code {
            0 => TouchFilter::Touch,
            1 => TouchFilter::Down,
            2 => TouchFilter::Drag,
            4 => TouchFilter::Up,
            8 => TouchFilter::Click,
            16 => TouchFilter::Press,
            32 => TouchFilter::Entry,
            64 => TouchFilter::Exit,
            256 => TouchFilter::DownUp,
            _ => return None,
        };
        Some(filter)
    }

    /// Motion updates collapse to the latest position per zone.
    pub fn is_drag(self) -> bool {
        self == TouchFilter::Drag
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchCommand {
    pub identifier: String,
    pub zone_cmd: String,
    pub col: i32,
    pub row: i32,
    pub filter: TouchFilter,
    pub edited_text: Option<String>,
}

impl TouchCommand {
    pub fn new(
        identifier: impl Into<String>,
        zone_cmd: impl Into<String>,
        col: i32,
        row: i32,
        filter: TouchFilter,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            zone_cmd: zone_cmd.into(),
            col,
            row,
            filter,
            edited_text: None,
        }
    }

    pub fn with_edited_text(mut self, text: impl Into<String>) -> Self {
        self.edited_text = Some(text.into());
        self
    }

    pub fn encode(&self) -> String {
        let mut out = format!(
            "{{{}~{}`{}`{}`{}",
            self.identifier,
            self.zone_cmd,
            self.col,
            self.row,
            self.filter.code()
        );
        if let Some(text) = &self.edited_text {
            out.push('~');
            out.push_str(text);
        }
        out.push('}');
        out
    }
}

impl fmt::Display for TouchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
