/// Prefix of the progress marker lines understood by the client.
///
/// A marker has the form `Loading-<percent> - <file name>`; everything else
/// on the event stream is an opaque log line.
pub const MARKER_PREFIX: &str = "Loading";

/// Result of classifying one line of output
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// The line matched the progress marker pattern
    Progress { file: String, percent: u8 },
    /// Anything else passes through verbatim
    Log(String),
}

/// Classify one line of output.
///
/// Pure text classification with no side effects. Malformed markers (missing
/// percent, missing separator, empty file name) fall through as log lines;
/// out-of-range percentages clamp to 100.
pub fn classify(line: &str) -> Classified {
    if let Some(rest) = line.strip_prefix(MARKER_PREFIX) {
        if let Some(rest) = rest.strip_prefix('-') {
            if let Some((percent_part, name_part)) = rest.split_once(" - ") {
                let name = name_part.trim();
                if let (Ok(percent), false) = (percent_part.trim().parse::<u32>(), name.is_empty())
                {
                    return Classified::Progress {
                        file: name.to_string(),
                        percent: percent.min(100) as u8,
                    };
                }
            }
        }
    }
    Classified::Log(line.to_string())
}

/// Render a progress marker line for one file
pub fn marker(file: &str, percent: u8) -> String {
    format!("{}-{} - {}", MARKER_PREFIX, percent.min(100), file)
}

/// Parse the frame counter from ffmpeg `-progress pipe:1` output (`frame=N`)
pub fn parse_frame_count(line: &str) -> Option<u64> {
    line.strip_prefix("frame=")?.trim().parse().ok()
}
