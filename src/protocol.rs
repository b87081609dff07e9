//! Wire-protocol constants and the bits of line formatting/parsing shared
//! across command handlers.

pub const PROTOCOL_VERSION: &str = "2.2";

pub const GAME_CLOCK_MS: u64 = 300_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Color {
    White,
    Black,
}

impl Color {
    pub fn parse(s: &str) -> Option<Color> {
        match s {
            "W" => Some(Color::White),
            "B" => Some(Color::Black),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::White => "W",
            Color::Black => "B",
        }
    }
}

/// Decimal digits only, nonempty, fewer than 9 digits.
pub fn parse_game_id(s: &str) -> Option<u64> {
    if s.is_empty() || s.len() >= 9 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn rating_or_unknown(rating: Option<i32>) -> String {
    match rating {
        Some(r) => r.to_string(),
        None => "?".to_string(),
    }
}

pub fn format_offer_row(game_id: u64, owner: &str, color: Color, rating: Option<i32>) -> String {
    format!(
        " {game_id} {owner} {} {} [offer]",
        color.as_str(),
        rating_or_unknown(rating)
    )
}

pub fn format_in_progress_row(
    game_id: u64,
    white: &str,
    black: &str,
    white_rating: Option<i32>,
    black_rating: Option<i32>,
) -> String {
    format!(
        " {game_id} {white} {black} ({}/{})  [in-progress]",
        rating_or_unknown(white_rating),
        rating_or_unknown(black_rating)
    )
}

pub fn format_ratings_row(name: &str, rating: i32) -> String {
    format!(" {name} {rating}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_id_rejects_non_digits() {
        assert_eq!(parse_game_id("12a"), None);
        assert_eq!(parse_game_id(""), None);
        assert_eq!(parse_game_id("-1"), None);
    }

    #[test]
    fn game_id_rejects_nine_or_more_digits() {
        assert_eq!(parse_game_id("123456789"), None);
        assert!(parse_game_id("12345678").is_some());
    }

    #[test]
    fn game_id_accepts_plain_decimal() {
        assert_eq!(parse_game_id("42"), Some(42));
    }

    #[test]
    fn color_parses_exact_letters_only() {
        assert_eq!(Color::parse("W"), Some(Color::White));
        assert_eq!(Color::parse("B"), Some(Color::Black));
        assert_eq!(Color::parse("w"), None);
        assert_eq!(Color::parse(""), None);
    }

    #[test]
    fn offer_row_shows_question_mark_for_unknown_rating() {
        assert_eq!(
            format_offer_row(1, "alice", Color::White, None),
            " 1 alice W ? [offer]"
        );
        assert_eq!(
            format_offer_row(1, "alice", Color::White, Some(1200)),
            " 1 alice W 1200 [offer]"
        );
    }
}
