//! Camelot wheel notation and harmonic compatibility scoring.
//!
//! The wheel has 12 numbered positions in two rings: `A` (minor) and `B`
//! (major). Compatibility is read from a fixed 24×24 table rather than computed
//! from wheel distance on every call, so musically meaningful exceptions stay
//! explicit and the function is a plain lookup.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Ring of the Camelot wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Mode {
    /// `A` side
    Minor,
    /// `B` side
    Major,
}

impl Mode {
    pub fn letter(self) -> char {
        match self {
            Mode::Minor => 'A',
            Mode::Major => 'B',
        }
    }
}

/// A validated Camelot key such as `8A` or `11B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CamelotKey {
    number: u8,
    mode: Mode,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unrecognized key notation: {0:?}")]
pub struct ParseKeyError(pub String);

impl CamelotKey {
    /// Returns `None` unless `number` is in 1..=12.
    pub fn new(number: u8, mode: Mode) -> Option<Self> {
        (1..=12).contains(&number).then_some(Self { number, mode })
    }

    pub fn number(self) -> u8 {
        self.number
    }

    pub fn mode(self) -> Mode {
        self.mode
    }

    /// All 24 keys, `1A..12A` then `1B..12B`.
    pub fn all() -> impl Iterator<Item = CamelotKey> {
        [Mode::Minor, Mode::Major]
            .into_iter()
            .flat_map(|mode| (1..=12).map(move |number| CamelotKey { number, mode }))
    }

    fn index(self) -> usize {
        let ring = match self.mode {
            Mode::Minor => 0,
            Mode::Major => 12,
        };
        ring + (self.number as usize - 1)
    }

    /// Key for a pitch class (0 = C) in the given mode.
    fn from_pitch_class(pitch_class: u8, mode: Mode) -> Self {
        // Minor keys share the wheel number of their relative major (3 semitones up).
        let major_pc = match mode {
            Mode::Major => pitch_class % 12,
            Mode::Minor => (pitch_class + 3) % 12,
        };
        // C major sits at 8B; each step clockwise is a fifth up.
        let number = (major_pc * 7 + 7) % 12 + 1;
        Self { number, mode }
    }
}

impl fmt::Display for CamelotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.number, self.mode.letter())
    }
}

impl FromStr for CamelotKey {
    type Err = ParseKeyError;

    /// Accepts Camelot notation (`8A`, `08b`) and common musical notation
    /// (`C`, `C major`, `Am`, `A minor`, `F#m`, `Bbm`, `Db maj`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        parse_camelot(trimmed)
            .or_else(|| parse_musical(trimmed))
            .ok_or_else(|| ParseKeyError(s.to_string()))
    }
}

fn parse_camelot(s: &str) -> Option<CamelotKey> {
    let letter = s.chars().last()?;
    let digits = &s[..s.len() - letter.len_utf8()];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mode = match letter.to_ascii_uppercase() {
        'A' => Mode::Minor,
        'B' => Mode::Major,
        _ => return None,
    };
    CamelotKey::new(digits.parse().ok()?, mode)
}

fn parse_musical(s: &str) -> Option<CamelotKey> {
    let mut chars = s.chars();
    let root = match chars.next()?.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let mut rest = chars.as_str();
    let mut pitch_class: u8 = root;
    if let Some(stripped) = rest.strip_prefix(['#', '♯']) {
        pitch_class = (pitch_class + 1) % 12;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix(['b', 'B', '♭']) {
        pitch_class = (pitch_class + 11) % 12;
        rest = stripped;
    }

    let mode = match rest.trim().to_lowercase().as_str() {
        "" | "maj" | "major" => Mode::Major,
        "m" | "min" | "minor" => Mode::Minor,
        _ => return None,
    };
    Some(CamelotKey::from_pitch_class(pitch_class, mode))
}

impl Serialize for CamelotKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CamelotKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde helper: unknown or malformed key strings become `None` instead of
/// failing the whole record.
pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Option<CamelotKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        let parsed = s.parse().ok();
        if parsed.is_none() && !s.trim().is_empty() {
            log::debug!("Ignoring unrecognized key {s:?}");
        }
        parsed
    }))
}

/// Relationship between two keys on the wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Identical,
    /// Same number, opposite letter
    Relative,
    /// ±1, same letter
    Adjacent,
    /// ±7 (mod 12), same letter
    PerfectFifth,
    /// ±3 (mod 12), same letter
    ThirdStep,
    /// ±4 (mod 12), same letter
    FourthStep,
    Clash,
}

impl Relation {
    pub fn between(a: CamelotKey, b: CamelotKey) -> Self {
        if a == b {
            return Relation::Identical;
        }
        if a.mode != b.mode {
            return if a.number == b.number {
                Relation::Relative
            } else {
                Relation::Clash
            };
        }
        let diff = (a.number as i32 - b.number as i32).rem_euclid(12);
        let ring = diff.min(12 - diff);
        // ±7 around a 12-ring lands 5 steps away the short way.
        match ring {
            1 => Relation::Adjacent,
            5 => Relation::PerfectFifth,
            3 => Relation::ThirdStep,
            4 => Relation::FourthStep,
            _ => Relation::Clash,
        }
    }

    pub fn score(self) -> f64 {
        match self {
            Relation::Identical => 1.0,
            Relation::Relative => 0.9,
            Relation::Adjacent => 0.8,
            Relation::PerfectFifth => 0.7,
            Relation::ThirdStep => 0.6,
            Relation::FourthStep => 0.5,
            Relation::Clash => 0.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Relation::Identical => "same key",
            Relation::Relative => "relative major/minor",
            Relation::Adjacent => "adjacent",
            Relation::PerfectFifth => "perfect fifth",
            Relation::ThirdStep => "three steps",
            Relation::FourthStep => "four steps",
            Relation::Clash => "clash",
        }
    }
}

static COMPAT_TABLE: LazyLock<[[f64; 24]; 24]> = LazyLock::new(|| {
    let mut table = [[0.0; 24]; 24];
    for a in CamelotKey::all() {
        for b in CamelotKey::all() {
            table[a.index()][b.index()] = Relation::between(a, b).score();
        }
    }
    table
});

/// Harmonic compatibility in [0, 1]. Symmetric.
pub fn compat(a: CamelotKey, b: CamelotKey) -> f64 {
    COMPAT_TABLE[a.index()][b.index()]
}

/// Keys scoring at least `min_score` against `source`, best first.
pub fn compatible_keys(source: CamelotKey, min_score: f64) -> Vec<(CamelotKey, f64)> {
    let mut keys: Vec<(CamelotKey, f64)> = CamelotKey::all()
        .map(|k| (k, compat(source, k)))
        .filter(|(_, score)| *score >= min_score)
        .collect();
    keys.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> CamelotKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_table_values() {
        assert_eq!(compat(k("8A"), k("8A")), 1.0);
        assert_eq!(compat(k("8A"), k("8B")), 0.9);
        assert_eq!(compat(k("8A"), k("7A")), 0.8);
        assert_eq!(compat(k("8A"), k("9A")), 0.8);
        assert_eq!(compat(k("8A"), k("3A")), 0.7);
        assert_eq!(compat(k("8A"), k("11A")), 0.6);
        assert_eq!(compat(k("8A"), k("12A")), 0.5);
        assert_eq!(compat(k("8A"), k("2A")), 0.0);
    }

    #[test]
    fn test_identity_and_symmetry() {
        for a in CamelotKey::all() {
            assert_eq!(compat(a, a), 1.0, "{a}");
            for b in CamelotKey::all() {
                assert_eq!(compat(a, b), compat(b, a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_wraparound() {
        // 12 and 1 are neighbours on the wheel
        assert_eq!(compat(k("12B"), k("1B")), 0.8);
        assert_eq!(compat(k("1A"), k("8A")), 0.7);
        assert_eq!(compat(k("1A"), k("6A")), 0.7);
    }

    #[test]
    fn test_cross_mode_other_number_clashes() {
        assert_eq!(compat(k("8A"), k("9B")), 0.0);
        assert_eq!(compat(k("8A"), k("7B")), 0.0);
    }

    #[test]
    fn test_parse_camelot_notation() {
        assert_eq!(k("8A").to_string(), "8A");
        assert_eq!(k(" 08b ").to_string(), "8B");
        assert_eq!(k("12a").to_string(), "12A");
        assert!("13A".parse::<CamelotKey>().is_err());
        assert!("0B".parse::<CamelotKey>().is_err());
        assert!("8C".parse::<CamelotKey>().is_err());
        assert!("".parse::<CamelotKey>().is_err());
    }

    #[test]
    fn test_parse_musical_notation() {
        assert_eq!(k("C").to_string(), "8B");
        assert_eq!(k("C major").to_string(), "8B");
        assert_eq!(k("G").to_string(), "9B");
        assert_eq!(k("F").to_string(), "7B");
        assert_eq!(k("B").to_string(), "1B");
        assert_eq!(k("E").to_string(), "12B");
        assert_eq!(k("F#").to_string(), "2B");
        assert_eq!(k("Db").to_string(), "3B");
        assert_eq!(k("C#").to_string(), "3B");
        assert_eq!(k("Bb maj").to_string(), "6B");
        assert_eq!(k("Am").to_string(), "8A");
        assert_eq!(k("A minor").to_string(), "8A");
        assert_eq!(k("Em").to_string(), "9A");
        assert_eq!(k("F#m").to_string(), "11A");
        assert_eq!(k("Bbm").to_string(), "3A");
        assert_eq!(k("Dm").to_string(), "7A");
        assert_eq!(k("BBM").to_string(), "3A");
        assert!("H minor".parse::<CamelotKey>().is_err());
        assert!("C dorian".parse::<CamelotKey>().is_err());
    }

    #[test]
    fn test_compatible_keys_sorted() {
        let keys = compatible_keys(k("8A"), 0.7);
        let labels: Vec<String> = keys.iter().map(|(key, _)| key.to_string()).collect();
        assert_eq!(labels, vec!["8A", "8B", "7A", "9A", "1A", "3A"]);
        assert!(keys.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_serde_round_trip_and_lenient() {
        let json = serde_json::to_string(&k("11B")).unwrap();
        assert_eq!(json, "\"11B\"");
        let back: CamelotKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k("11B"));

        #[derive(Deserialize)]
        struct Row {
            #[serde(default, deserialize_with = "deserialize_lenient")]
            key: Option<CamelotKey>,
        }
        let row: Row = serde_json::from_str(r#"{"key": "garbage"}"#).unwrap();
        assert!(row.key.is_none());
        let row: Row = serde_json::from_str(r#"{"key": "Am"}"#).unwrap();
        assert_eq!(row.key, Some(k("8A")));
        let row: Row = serde_json::from_str(r#"{}"#).unwrap();
        assert!(row.key.is_none());
    }
}
