use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Status pattern the dedicated server writes into its console title on
/// every game tick.
const TITLE_PATTERN: &str =
    r"^Game dedicated server - ([A-Za-z0-9_]+) ([0-9]+)/([0-9]+) players \(([A-Za-z0-9_]+)\)";

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TITLE_PATTERN).expect("title pattern is valid"))
}

/// Snapshot of the dedicated server's state, scraped from one console
/// title. Unknown fields are an empty string or -1, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub map_name: String,
    pub playlist_name: String,
    pub player_count: i32,
    pub max_players: i32,
}

impl Default for ServerStatus {
    fn default() -> ServerStatus {
        ServerStatus {
            map_name: String::new(),
            playlist_name: String::new(),
            player_count: -1,
            max_players: -1,
        }
    }
}

impl ServerStatus {
    /// Parse one console title into this snapshot. Returns false (leaving
    /// the snapshot untouched) when the title does not match the status
    /// pattern. Numeric fields that somehow fail to parse become 0.
    pub fn parse_title(&mut self, title: &str) -> bool {
        let Some(captures) = title_regex().captures(title) else {
            return false;
        };
        self.map_name = captures[1].to_string();
        self.player_count = captures[2].parse().unwrap_or(0);
        self.max_players = captures[3].parse().unwrap_or(0);
        self.playlist_name = captures[4].to_string();
        true
    }

    pub(crate) fn pattern() -> &'static str {
        TITLE_PATTERN
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.player_count >= 0 {
            write!(f, "{}", self.player_count)?;
        } else {
            write!(f, "?")?;
        }
        if self.max_players >= 0 {
            write!(f, "/{}", self.max_players)?;
        } else {
            write!(f, "/?")?;
        }
        if !self.map_name.is_empty() {
            write!(f, " {}", self.map_name)?;
        } else {
            write!(f, " ???")?;
        }
        if !self.playlist_name.is_empty() {
            write!(f, " {}", self.playlist_name)?;
        } else {
            write!(f, " ???")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_title() {
        let mut status = ServerStatus::default();
        assert!(status.parse_title("Game dedicated server - mp_grave 3/8 players (mp_ffa)"));
        assert_eq!(status.map_name, "mp_grave");
        assert_eq!(status.player_count, 3);
        assert_eq!(status.max_players, 8);
        assert_eq!(status.playlist_name, "mp_ffa");
    }

    #[test]
    fn trailing_text_after_the_pattern_is_ignored() {
        let mut status = ServerStatus::default();
        assert!(status.parse_title("Game dedicated server - mp_rise 0/12 players (mp_tdm) [extra]"));
        assert_eq!(status.map_name, "mp_rise");
    }

    #[test]
    fn non_matching_title_leaves_prior_state_untouched() {
        let mut status = ServerStatus::default();
        assert!(status.parse_title("Game dedicated server - mp_grave 3/8 players (mp_ffa)"));

        assert!(!status.parse_title("random text"));
        assert!(!status.parse_title("Game dedicated server - starting"));
        assert_eq!(status.map_name, "mp_grave");
        assert_eq!(status.player_count, 3);
    }

    #[test]
    fn unknown_snapshot_renders_with_sentinels() {
        assert_eq!(ServerStatus::default().to_string(), "?/? ??? ???");
    }

    #[test]
    fn known_snapshot_renders_counts_then_names() {
        let mut status = ServerStatus::default();
        status.parse_title("Game dedicated server - mp_grave 3/8 players (mp_ffa)");
        assert_eq!(status.to_string(), "3/8 mp_grave mp_ffa");
    }
}
