//! Fixed-layout terminal table of the live requests.

use std::{collections::HashMap, io::Write, sync::PoisonError};

use crossterm::{ExecutableCommand, QueueableCommand, cursor, style, terminal};
use n0_error::Result;
use tracing::debug;

use super::{
    processor::MonitorShared,
    state::{OngoingRequest, RequestTable},
};

/// Width of the method and path column.
pub const METHOD_PATH_WIDTH: usize = 23;

/// Shown on the last line when there are more requests than lines.
pub const OVERFLOW_MARKER: &str = "...";

const ELLIPSIS: &str = "...";

// Fixed columns: id, client ip, method and path, state. Each includes its " | " separator.
const ID_COLUMN: usize = 9 + 3;
const CLIENT_IP_COLUMN: usize = 15 + 3;
const METHOD_PATH_COLUMN: usize = METHOD_PATH_WIDTH + 3;
const STATE_COLUMN: usize = 7 + 3;
const FIXED_COLUMNS: usize = ID_COLUMN + CLIENT_IP_COLUMN + METHOD_PATH_COLUMN + STATE_COLUMN;

/// Size of the drawing area in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySize {
    pub width: u16,
    pub height: u16,
}

impl DisplaySize {
    /// Used when the terminal size cannot be queried.
    pub const FALLBACK: Self = Self {
        width: 150,
        height: 40,
    };

    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Queries the size of the terminal.
    pub fn detect() -> Self {
        terminal::size()
            .ok()
            .filter(|(width, height)| *width > 0 && *height > 0)
            .map_or(Self::FALLBACK, |(width, height)| Self { width, height })
    }
}

/// Shortens `text` to [`METHOD_PATH_WIDTH`] characters and pads it to exactly that width.
///
/// A long query string loses its middle, or all of it if too little would remain. If that is
/// still too long the middle of the path goes next. When neither fits, the untouched text is cut
/// at the end, so the result never carries more than one ellipsis.
pub fn truncate_method_path(text: &str) -> String {
    let width = METHOD_PATH_WIDTH;
    let chars: Vec<char> = text.chars().collect();
    let mut out = match chars.len() > width {
        true => chars
            .iter()
            .position(|c| *c == '?')
            .and_then(|separator| elide_around(&chars, separator, width))
            .unwrap_or_else(|| cut(&chars, width)),
        false => chars,
    };
    out.resize(width.max(out.len()), ' ');
    out.into_iter().collect()
}

fn elide_around(chars: &[char], separator: usize, width: usize) -> Option<Vec<char>> {
    let ellipsis = ELLIPSIS.len() as isize;

    // Query first. The separator counts towards the visible part.
    let query = (chars.len() - separator) as isize;
    let remove = (chars.len() - width) as isize;
    let out = match halves(query - remove - ellipsis) {
        Some((before, after)) => {
            let mut out = chars[..=separator + before].to_vec();
            out.extend(ELLIPSIS.chars());
            out.extend_from_slice(&chars[chars.len() - after..]);
            out
        }
        None => {
            let mut out = chars[..=separator].to_vec();
            out.extend(ELLIPSIS.chars());
            out
        }
    };
    if out.len() <= width {
        return Some(out);
    }

    // Then the path, in front of the separator.
    let remove = out.len() - width;
    let (before, _) = halves(separator as isize - remove as isize - ellipsis)?;
    let mut shorter = out[..before].to_vec();
    shorter.extend(ELLIPSIS.chars());
    shorter.extend_from_slice(&out[before + remove..]);
    (shorter.len() <= width).then_some(shorter)
}

/// Splits `visible` characters around an ellipsis, if both sides keep more than one character.
fn halves(visible: isize) -> Option<(usize, usize)> {
    let before = visible / 2;
    let after = visible - before;
    (before > 1 && after > 1).then_some((before as usize, after as usize))
}

fn cut(chars: &[char], width: usize) -> Vec<char> {
    let keep = width.saturating_sub(ELLIPSIS.len()).min(chars.len());
    let mut out = chars[..keep].to_vec();
    out.extend(ELLIPSIS.chars());
    out
}

/// Number of filled cells of a progress bar `bar` cells wide, rounded to the nearest cell.
pub fn progress_fill(so_far: u64, expected: u64, bar: usize) -> usize {
    if expected == 0 {
        return bar;
    }
    let filled = (u128::from(so_far) * bar as u128 + u128::from(expected) / 2) / u128::from(expected);
    usize::try_from(filled).map_or(bar, |filled| filled.min(bar))
}

/// Formats `n` with a comma between groups of three digits.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(digit);
    }
    out
}

/// Draws the request table.
///
/// Glyph runs for progress bars and padding are built once per length and reused.
#[derive(Debug, Default)]
pub struct Renderer {
    filled: HashMap<usize, String>,
    unfilled: HashMap<usize, String>,
    spaces: HashMap<usize, String>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lays out one screen. Every line is exactly one cell narrower than the display.
    pub fn frame(&mut self, table: &RequestTable, size: DisplaySize) -> Vec<String> {
        let width = usize::from(size.width).saturating_sub(1);
        let height = usize::from(size.height);
        if height == 0 {
            return Vec::new();
        }
        let mut lines = Vec::with_capacity(height);
        let mut requests = table.iter();
        for _ in 0..height - 1 {
            let line = match requests.next() {
                Some(request) => self.row(request, width),
                None => self.spaces(width).to_string(),
            };
            lines.push(line);
        }
        let last = match requests.next() {
            Some(_) if table.len() > height => self.fit(OVERFLOW_MARKER.to_string(), width),
            Some(request) => self.row(request, width),
            None => self.spaces(width).to_string(),
        };
        lines.push(last);
        lines
    }

    /// Lays out one request.
    pub fn row(&mut self, request: &OngoingRequest, width: usize) -> String {
        let mut line = format!(
            "{:>9} | {:<15} | {} | {:>7} | ",
            request.id.0,
            request.client_ip,
            request.method_path(),
            request.state.to_string(),
        );
        let mut remaining = width.saturating_sub(FIXED_COLUMNS);
        if request.bytes_expected > 0 {
            let fraction = format!(
                "{} / {} ",
                group_thousands(request.bytes_so_far),
                group_thousands(request.bytes_expected)
            );
            remaining = remaining.saturating_sub(fraction.len());
            let bar = remaining.saturating_sub(2);
            let filled = progress_fill(request.bytes_so_far, request.bytes_expected, bar);
            line.push_str(&fraction);
            line.push_str(self.filled(filled));
            line.push_str(self.unfilled(bar - filled));
        } else {
            let counter = group_thousands(request.bytes_so_far);
            remaining = remaining.saturating_sub(counter.len());
            line.push_str(&counter);
            line.push_str(self.spaces(remaining));
        }
        self.fit(line, width)
    }

    /// Draws one screen from the top left corner.
    pub fn paint<W: Write>(
        &mut self,
        out: &mut W,
        table: &RequestTable,
        size: DisplaySize,
    ) -> std::io::Result<()> {
        for (row, line) in (0u16..).zip(self.frame(table, size)) {
            out.queue(cursor::MoveTo(0, row))?
                .queue(style::Print(line))?;
        }
        out.flush()
    }

    /// Repaints whenever the table changes, until the monitor stops.
    ///
    /// `size` fixes the display size, otherwise it is queried before every repaint.
    pub async fn run<W: Write>(
        mut self,
        shared: &MonitorShared,
        mut out: W,
        size: Option<DisplaySize>,
    ) -> Result<()> {
        out.execute(cursor::Hide)?
            .execute(terminal::Clear(terminal::ClearType::All))?;
        let res = self.render_loop(shared, &mut out, size).await;
        shared.stop.cancel();
        out.execute(cursor::Show).ok();
        res
    }

    async fn render_loop<W: Write>(
        &mut self,
        shared: &MonitorShared,
        out: &mut W,
        size: Option<DisplaySize>,
    ) -> Result<()> {
        loop {
            shared.dirty.notified().await;
            {
                // Changes signalled since the wake up are part of this repaint.
                let stale = std::pin::pin!(shared.dirty.notified());
                stale.enable();
            }
            let stopping = shared.stop.is_cancelled();
            let size = size.unwrap_or_else(DisplaySize::detect);
            {
                let table = shared.table.lock().unwrap_or_else(PoisonError::into_inner);
                self.paint(out, &table, size)?;
            }
            if stopping {
                debug!("renderer stopped");
                return Ok(());
            }
        }
    }

    /// Pads or crops `line` to `width` characters.
    fn fit(&mut self, mut line: String, width: usize) -> String {
        let len = line.chars().count();
        if len > width {
            line = line.chars().take(width).collect();
        } else {
            line.push_str(self.spaces(width - len));
        }
        line
    }

    fn filled(&mut self, n: usize) -> &str {
        self.filled
            .entry(n)
            .or_insert_with(|| format!("[{}", "#".repeat(n)))
    }

    fn unfilled(&mut self, n: usize) -> &str {
        self.unfilled
            .entry(n)
            .or_insert_with(|| format!("{}]", ".".repeat(n)))
    }

    fn spaces(&mut self, n: usize) -> &str {
        self.spaces.entry(n).or_insert_with(|| " ".repeat(n))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::Record;

    fn table(lines: &[&str]) -> RequestTable {
        let mut table = RequestTable::new();
        for line in lines {
            table.apply(line.parse::<Record>().unwrap());
        }
        table
    }

    fn requests(n: u64) -> RequestTable {
        let lines: Vec<String> = (1..=n).map(|id| format!("{id} new 10.0.0.1 GET /{id}")).collect();
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        table(&lines)
    }

    #[test]
    fn short_text_is_padded() {
        let out = truncate_method_path("GET /index.html");
        assert_eq!(out, "GET /index.html        ");
        assert_eq!(out.len(), METHOD_PATH_WIDTH);
    }

    #[test]
    fn whole_path_survives_when_query_has_no_room() {
        let out = truncate_method_path("/a/very/long/path?with=aQueryStringThatIsQuiteLong");
        assert_eq!(out, "/a/very/long/path?...  ");
        assert_eq!(out.chars().count(), METHOD_PATH_WIDTH);
        assert_eq!(out.matches("...").count(), 1);
    }

    #[test]
    fn request_line_with_long_query_keeps_the_path() {
        let out = truncate_method_path("GET /a/very/long/path?with=aQueryStringThatIsQuiteLong");
        assert_eq!(out, "GET /a/very/long/pat...");
        assert_eq!(out.matches("...").count(), 1);
    }

    #[test]
    fn query_is_dropped_when_the_path_fits() {
        let out = truncate_method_path("GET /static/app.js?v=1234567890");
        assert_eq!(out, "GET /static/app.js?... ");
    }

    #[test]
    fn query_too_long_to_split_is_cut() {
        let out = truncate_method_path("GET /search?q=abcdefghijklmnop");
        assert_eq!(out, "GET /search?q=abcdef...");
    }

    #[test]
    fn long_path_with_query_is_cut() {
        let out = truncate_method_path("GET /a/very/long/path/segment?x=1");
        assert_eq!(out, "GET /a/very/long/pat...");
    }

    #[test]
    fn path_without_query_is_cut() {
        let out = truncate_method_path("GET /a/really/long/path/without/query");
        assert_eq!(out, "GET /a/really/long/p...");
    }

    #[test]
    fn truncated_text_has_one_ellipsis() {
        for text in [
            "GET /a/very/long/path?with=aQueryStringThatIsQuiteLong",
            "POST /api/v1/items?page=2&sort=name&filter=active",
            "GET /x?aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "DELETE /a/b/c/d/e/f/g/h/i/j/k/l/m/n/o/p?q",
        ] {
            let out = truncate_method_path(text);
            assert_eq!(out.chars().count(), METHOD_PATH_WIDTH, "{out:?}");
            assert_eq!(out.matches("...").count(), 1, "{out:?}");
        }
    }

    #[test]
    fn bar_fill_rounds_and_clamps() {
        assert_eq!(progress_fill(50, 100, 10), 5);
        assert_eq!(progress_fill(0, 100, 10), 0);
        assert_eq!(progress_fill(100, 100, 10), 10);
        assert_eq!(progress_fill(14, 100, 10), 1);
        assert_eq!(progress_fill(15, 100, 10), 2);
        assert_eq!(progress_fill(500, 100, 10), 10);
        assert_eq!(progress_fill(u64::MAX, u64::MAX, 80), 80);
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }

    #[test]
    fn row_with_progress_bar() {
        let table = table(&[
            "42 new 192.168.1.20 GET /file.bin",
            "42 length 1000",
            "42 progress 500",
        ]);
        let request = table.get(crate::protocol::RequestId(42)).unwrap();
        let row = Renderer::new().row(request, 149);
        assert_eq!(row.chars().count(), 149);
        let prefix = "       42 | 192.168.1.20    | GET /file.bin           |  Stream | 500 / 1,000 ";
        assert!(row.starts_with(prefix), "{row:?}");
        let bar = &row[prefix.len()..];
        assert!(bar.starts_with('[') && bar.ends_with(']'));
        let cells = bar.len() - 2;
        assert_eq!(bar.matches('#').count(), progress_fill(500, 1000, cells));
        assert_eq!(bar.matches('#').count(), cells / 2 + cells % 2);
    }

    #[test]
    fn row_with_counter() {
        let table = table(&["3 new 10.0.0.1 GET /stream", "3 sent", "3 progress 65536"]);
        let request = table.get(crate::protocol::RequestId(3)).unwrap();
        let row = Renderer::new().row(request, 149);
        assert_eq!(row.chars().count(), 149);
        assert!(row.starts_with(
            "        3 | 10.0.0.1        | GET /stream             |  Stream | 65,536"
        ));
        assert!(row.ends_with(' '));
    }

    #[test]
    fn exactly_full_display_shows_every_request() {
        let size = DisplaySize::new(100, 5);
        let frame = Renderer::new().frame(&requests(5), size);
        assert_eq!(frame.len(), 5);
        assert!(frame[4].trim_start().starts_with("5 |"));
        assert!(frame.iter().all(|line| line.chars().count() == 99));
    }

    #[test]
    fn overflow_shows_marker() {
        let size = DisplaySize::new(100, 5);
        let frame = Renderer::new().frame(&requests(6), size);
        assert_eq!(frame.len(), 5);
        assert!(frame[3].trim_start().starts_with("4 |"));
        assert_eq!(frame[4].trim_end(), OVERFLOW_MARKER);
    }

    #[test]
    fn few_requests_leave_blank_lines() {
        let size = DisplaySize::new(100, 5);
        let frame = Renderer::new().frame(&requests(2), size);
        assert!(frame[1].trim_start().starts_with("2 |"));
        for line in &frame[2..] {
            assert_eq!(line.trim(), "");
            assert_eq!(line.len(), 99);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_repaints_once() {
        let shared = MonitorShared::new();
        let mut out = Vec::new();
        let changes = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            for id in 1..=5 {
                let record = format!("{id} new 10.0.0.1 GET /{id}").parse::<Record>().unwrap();
                shared.table().apply(record);
                shared.dirty.notify_one();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            shared.stop.cancel();
            shared.dirty.notify_one();
        };
        let renderer = Renderer::new().run(&shared, &mut out, Some(DisplaySize::new(80, 8)));
        let (rendered, ()) = tokio::join!(renderer, changes);
        rendered.unwrap();

        // The first screen, the burst, the last screen.
        let screen = String::from_utf8(out).unwrap();
        assert_eq!(screen.matches("\x1b[1;1H").count(), 3);
        assert!(screen.contains("        5 | 10.0.0.1"));
    }

    #[test]
    fn narrow_display_crops_rows() {
        let size = DisplaySize::new(40, 3);
        let frame = Renderer::new().frame(&requests(1), size);
        assert!(frame.iter().all(|line| line.chars().count() == 39));
    }
}
