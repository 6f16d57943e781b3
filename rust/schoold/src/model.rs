use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier prefix for snapshots synthesized from live data.
pub const VIRTUAL_SNAPSHOT_PREFIX: &str = "virtual-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PupilStatus {
    Active,
    Inactive,
    Graduated,
    Transferred,
}

impl PupilStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "graduated" => Some(Self::Graduated),
            "transferred" => Some(Self::Transferred),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Graduated => "graduated",
            Self::Transferred => "transferred",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guardian {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pupil {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub admission_number: Option<String>,
    pub gender: Option<String>,
    pub class_id: String,
    pub class_name: Option<String>,
    pub section: Option<String>,
    pub status: PupilStatus,
    pub family_id: Option<String>,
    #[serde(default)]
    pub guardians: Vec<Guardian>,
    pub photo_url: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermStatus {
    Past,
    Current,
    Future,
}

impl TermStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Past => "past",
            Self::Current => "current",
            Self::Future => "future",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Term {
    pub id: String,
    pub academic_year_id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcademicYear {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub terms: Vec<Term>,
}

impl AcademicYear {
    pub fn term(&self, term_id: &str) -> Option<&Term> {
        self.terms.iter().find(|t| t.id == term_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PupilTermSnapshot {
    pub id: String,
    pub pupil_id: String,
    pub term_id: String,
    pub academic_year_id: String,
    pub class_id: String,
    pub class_name: Option<String>,
    pub section: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub admission_number: Option<String>,
    pub fingerprint: String,
    pub captured_at: DateTime<Utc>,
}

impl PupilTermSnapshot {
    /// Captures the placement attributes of `pupil` for `term`. The id is
    /// left to the caller: a UUID for durable rows, `virtual_id` otherwise.
    pub fn capture(
        id: String,
        pupil: &Pupil,
        term: &Term,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let mut snap = Self {
            id,
            pupil_id: pupil.id.clone(),
            term_id: term.id.clone(),
            academic_year_id: term.academic_year_id.clone(),
            class_id: pupil.class_id.clone(),
            class_name: pupil.class_name.clone(),
            section: pupil.section.clone(),
            first_name: pupil.first_name.clone(),
            last_name: pupil.last_name.clone(),
            admission_number: pupil.admission_number.clone(),
            fingerprint: String::new(),
            captured_at,
        };
        snap.fingerprint = snap.compute_fingerprint();
        snap
    }

    pub fn virtual_id(pupil_id: &str, term_id: &str) -> String {
        format!("{}{}-{}", VIRTUAL_SNAPSHOT_PREFIX, pupil_id, term_id)
    }

    pub fn is_virtual(&self) -> bool {
        self.id.starts_with(VIRTUAL_SNAPSHOT_PREFIX)
    }

    /// SHA-256 over the captured attributes only; ids and timestamps are
    /// excluded so two captures of an unchanged pupil hash equal.
    pub fn compute_fingerprint(&self) -> String {
        let mut h = Sha256::new();
        for part in [
            Some(self.class_id.as_str()),
            self.class_name.as_deref(),
            self.section.as_deref(),
            Some(self.first_name.as_str()),
            Some(self.last_name.as_str()),
            self.admission_number.as_deref(),
        ] {
            match part {
                Some(s) => {
                    h.update([1u8]);
                    h.update((s.len() as u64).to_le_bytes());
                    h.update(s.as_bytes());
                }
                None => h.update([0u8]),
            }
        }
        h.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Live,
    Snapshot,
}

/// A pupil as shown for a specific term, plus where the placement came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualPupil {
    #[serde(flatten)]
    pub pupil: Pupil,
    pub is_historical: bool,
    pub data_source: DataSource,
}

#[derive(Debug, Clone, Default)]
pub struct PupilFilter {
    pub class_id: Option<String>,
    pub status: Option<PupilStatus>,
    pub include_inactive: bool,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    pub fn pupil(id: &str, class_id: &str, class_name: &str) -> Pupil {
        Pupil {
            id: id.to_string(),
            first_name: "Amina".to_string(),
            last_name: format!("Nakato-{}", id),
            admission_number: Some(format!("ADM-{}", id)),
            gender: Some("F".to_string()),
            class_id: class_id.to_string(),
            class_name: Some(class_name.to_string()),
            section: Some("East".to_string()),
            status: PupilStatus::Active,
            family_id: Some("fam-1".to_string()),
            guardians: vec![Guardian {
                name: "Grace Nakato".to_string(),
                relationship: Some("mother".to_string()),
                phone: None,
            }],
            photo_url: Some("photos/p.jpg".to_string()),
            updated_at: None,
        }
    }

    /// Year 2023 with T1 (Feb-Apr), T2 (May-Aug) and T3 (Sep-Dec).
    pub fn year_2023() -> AcademicYear {
        let term = |id: &str, start: &str, end: &str, order: i64| Term {
            id: id.to_string(),
            academic_year_id: "y2023".to_string(),
            name: id.to_uppercase(),
            start_date: date(start),
            end_date: date(end),
            sort_order: order,
        };
        AcademicYear {
            id: "y2023".to_string(),
            name: "2023".to_string(),
            start_date: date("2023-02-01"),
            end_date: date("2023-12-01"),
            terms: vec![
                term("t1", "2023-02-01", "2023-04-28", 0),
                term("t2", "2023-05-22", "2023-08-18", 1),
                term("t3", "2023-09-11", "2023-12-01", 2),
            ],
        }
    }
}
