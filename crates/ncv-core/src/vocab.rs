//! Canonical vocabulary and the static source-code tables that map onto it.
//!
//! Every source code maps to exactly one canonical value. Unrecognized codes fall
//! into `Unknown` instead of failing, so aggregation never drops a record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Raised when a stored canonical string does not name a vocabulary member.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{value}` is not a canonical {vocabulary} value")]
pub struct VocabularyError {
    pub vocabulary: &'static str,
    pub value: String,
}

macro_rules! canonical_vocabulary {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = VocabularyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(VocabularyError {
                        vocabulary: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

canonical_vocabulary! {
    /// Registered party affiliation.
    Party, "party" {
        Dem => "DEM",
        Rep => "REP",
        Una => "UNA",
        Lib => "LIB",
        Gre => "GRE",
        Other => "OTHER",
        Unknown => "UNKNOWN",
    }
}

canonical_vocabulary! {
    Race, "race" {
        White => "WHITE",
        Black => "BLACK",
        Asian => "ASIAN",
        AmericanIndian => "AMERICAN_INDIAN",
        PacificIslander => "PACIFIC_ISLANDER",
        Multiracial => "MULTIRACIAL",
        Other => "OTHER",
        Unknown => "UNKNOWN",
    }
}

canonical_vocabulary! {
    Ethnicity, "ethnicity" {
        Hispanic => "HISPANIC",
        NotHispanic => "NOT_HISPANIC",
        Unknown => "UNKNOWN",
    }
}

canonical_vocabulary! {
    Gender, "gender" {
        Male => "MALE",
        Female => "FEMALE",
        Unknown => "UNKNOWN",
    }
}

canonical_vocabulary! {
    /// Registration status as carried by the voter file.
    VoterStatus, "status" {
        Active => "ACTIVE",
        Inactive => "INACTIVE",
        Temporary => "TEMPORARY",
        Removed => "REMOVED",
        Denied => "DENIED",
        Unknown => "UNKNOWN",
    }
}

canonical_vocabulary! {
    AgeBucket, "age bucket" {
        From18To25 => "18-25",
        From26To35 => "26-35",
        From36To50 => "36-50",
        From51To65 => "51-65",
        Over65 => "65+",
        Unknown => "UNKNOWN",
    }
}

fn code_key(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_ascii_uppercase()
}

impl Party {
    /// Maps a source party code (`party_cd` / `party_abbrv`).
    pub fn from_code(raw: &str) -> Self {
        match code_key(raw).as_str() {
            "DEM" | "DEMOCRATIC" => Party::Dem,
            "REP" | "REPUBLICAN" => Party::Rep,
            "UNA" | "UNAFFILIATED" => Party::Una,
            "LIB" | "LIBERTARIAN" => Party::Lib,
            "GRE" | "GREEN" => Party::Gre,
            "CST" | "NLB" | "JFA" | "WTP" => Party::Other,
            _ => Party::Unknown,
        }
    }
}

impl Race {
    pub fn from_code(raw: &str) -> Self {
        match code_key(raw).as_str() {
            "W" => Race::White,
            "B" => Race::Black,
            "A" => Race::Asian,
            "I" => Race::AmericanIndian,
            "P" => Race::PacificIslander,
            "M" => Race::Multiracial,
            "O" => Race::Other,
            _ => Race::Unknown,
        }
    }
}

impl Ethnicity {
    pub fn from_code(raw: &str) -> Self {
        match code_key(raw).as_str() {
            "HL" => Ethnicity::Hispanic,
            "NL" => Ethnicity::NotHispanic,
            _ => Ethnicity::Unknown,
        }
    }
}

impl Gender {
    pub fn from_code(raw: &str) -> Self {
        match code_key(raw).as_str() {
            "M" => Gender::Male,
            "F" => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

impl VoterStatus {
    pub fn from_code(raw: &str) -> Self {
        match code_key(raw).as_str() {
            "A" => VoterStatus::Active,
            "I" => VoterStatus::Inactive,
            "S" => VoterStatus::Temporary,
            "R" => VoterStatus::Removed,
            "D" => VoterStatus::Denied,
            _ => VoterStatus::Unknown,
        }
    }
}

/// Earliest birth year treated as plausible.
pub const MIN_BIRTH_YEAR: i32 = 1900;

impl AgeBucket {
    pub fn from_age(age: i32) -> Self {
        match age {
            18..=25 => AgeBucket::From18To25,
            26..=35 => AgeBucket::From26To35,
            36..=50 => AgeBucket::From36To50,
            51..=65 => AgeBucket::From51To65,
            a if a > 65 => AgeBucket::Over65,
            _ => AgeBucket::Unknown,
        }
    }

    /// Buckets a raw birth year against `reference_year`. Non-numeric or implausible
    /// years land in `Unknown`.
    pub fn from_birth_year(raw: &str, reference_year: i32) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return AgeBucket::Unknown;
        }
        let Ok(birth_year) = trimmed.parse::<i32>() else {
            return AgeBucket::Unknown;
        };
        if birth_year < MIN_BIRTH_YEAR || birth_year > reference_year {
            return AgeBucket::Unknown;
        }
        Self::from_age(reference_year - birth_year)
    }
}
