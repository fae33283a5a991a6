//! C2: Triage Assessor.
//!
//! Grounded in `industry/gesundheit/triage.py`: a structured symptom list
//! drives the base severity score (mean severity plus modifiers for
//! worsening, fever, pain, and duration), free text is scanned against
//! emergency/urgent phrase lists, and a patient risk multiplier scales the
//! combined score into an urgency classification. Typed enums replace the
//! Python's `str, Enum` mixins per the "stringly typed at the core" redesign
//! note — these only serialize to strings at the persistence boundary
//! (`database::audit`, etc).

use serde::{Deserialize, Serialize};

use crate::error::{PhoneAgentError, Result};

/// Urgency levels following German ambulatory triage standards
/// (Bereitschaftsdienst-Triage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UrgencyLevel {
    NonUrgent,
    Standard,
    Urgent,
    VeryUrgent,
    Emergency,
}

impl UrgencyLevel {
    pub fn max_wait_minutes(self) -> Option<u32> {
        match self {
            UrgencyLevel::Emergency => Some(0),
            UrgencyLevel::VeryUrgent => Some(10),
            UrgencyLevel::Urgent => Some(30),
            UrgencyLevel::Standard => Some(90),
            UrgencyLevel::NonUrgent => None,
        }
    }

    pub fn requires_callback(self) -> bool {
        matches!(self, UrgencyLevel::Emergency | UrgencyLevel::VeryUrgent)
    }

    pub fn requires_doctor(self) -> bool {
        matches!(
            self,
            UrgencyLevel::Emergency | UrgencyLevel::VeryUrgent | UrgencyLevel::Urgent
        )
    }
}

/// Patient risk factors feeding `calculate_risk_multiplier`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientContext {
    pub age: Option<u32>,
    pub is_pregnant: bool,
    pub is_diabetic: bool,
    pub is_immunocompromised: bool,
    pub has_heart_condition: bool,
}

/// One reported symptom feeding the base severity score. `severity` and
/// `pain_level` are both 1-10 scales; `fever_temp` is in Celsius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symptom {
    pub name: String,
    pub severity: u8,
    pub duration_hours: Option<f64>,
    pub is_worsening: bool,
    pub fever: bool,
    pub fever_temp: Option<f64>,
    pub pain_level: Option<u8>,
}

impl Symptom {
    pub fn new(name: impl Into<String>, severity: u8) -> Self {
        Self {
            name: name.into(),
            severity,
            duration_hours: None,
            is_worsening: false,
            fever: false,
            fever_temp: None,
            pain_level: None,
        }
    }
}

impl PatientContext {
    /// Matches `PatientContext.calculate_risk_multiplier` exactly, including
    /// the 2.5x cap.
    pub fn risk_multiplier(&self) -> f64 {
        let mut multiplier = 1.0;
        if let Some(age) = self.age {
            if age < 2 || age > 75 {
                multiplier *= 1.5;
            } else if age > 65 {
                multiplier *= 1.2;
            }
        }
        if self.is_pregnant {
            multiplier *= 1.3;
        }
        if self.is_diabetic {
            multiplier *= 1.2;
        }
        if self.is_immunocompromised {
            multiplier *= 1.5;
        }
        if self.has_heart_condition {
            multiplier *= 1.3;
        }
        multiplier.min(2.5)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageResult {
    pub urgency: UrgencyLevel,
    pub risk_score: f64,
    pub primary_concern: String,
    pub max_wait_minutes: Option<u32>,
    pub requires_callback: bool,
    pub requires_doctor: bool,
    pub emergency_symptoms: Vec<String>,
    pub assessment_notes: Vec<String>,
    pub recommended_action: String,
    pub safety_instructions: Vec<String>,
}

struct PatternSet {
    category: &'static str,
    phrases: &'static [&'static str],
}

const EMERGENCY_PATTERNS: &[PatternSet] = &[
    PatternSet {
        category: "chest_pain",
        phrases: &[
            "brustschmerz", "brustdruck", "engegefühl brust", "herzschmerz",
            "stechen brust", "brennen brust",
        ],
    },
    PatternSet {
        category: "breathing_difficulty",
        phrases: &[
            "atemnot", "kurzatmig", "kann nicht atmen", "luftnot", "ersticken",
            "atemprobleme",
        ],
    },
    PatternSet {
        category: "stroke_symptoms",
        phrases: &[
            "lähmung", "taubheit gesicht", "arm schwäche", "sprachstörung",
            "verwirrung plötzlich", "sehen verschwommen",
        ],
    },
    PatternSet {
        category: "severe_bleeding",
        phrases: &["starke blutung", "blut nicht stoppen", "große wunde", "viel blut"],
    },
    PatternSet {
        category: "unconsciousness",
        phrases: &["bewusstlos", "ohnmacht", "nicht ansprechbar", "zusammengebrochen"],
    },
    PatternSet {
        category: "severe_allergic",
        phrases: &[
            "allergischer schock", "anaphylaxie", "geschwollene zunge",
            "kann nicht schlucken", "ausschlag ganzer körper",
        ],
    },
    PatternSet {
        category: "severe_pain",
        phrases: &[
            "unerträgliche schmerzen", "stärkste schmerzen",
            "schlimmste schmerzen meines lebens",
        ],
    },
];

const URGENT_PATTERNS: &[PatternSet] = &[
    PatternSet {
        category: "high_fever",
        phrases: &["hohes fieber", "über 39 grad", "fieber kind", "schüttelfrost", "fieber seit tagen"],
    },
    PatternSet {
        category: "acute_pain",
        phrases: &["starke schmerzen", "akute schmerzen", "plötzliche schmerzen"],
    },
    PatternSet {
        category: "vomiting",
        phrases: &["erbrechen", "kann nichts bei mir behalten", "übelkeit stark"],
    },
    PatternSet {
        category: "injury",
        phrases: &["verletzung", "unfall", "sturz", "gebrochen"],
    },
    PatternSet {
        category: "infection_signs",
        phrases: &["eitrig", "entzündet", "geschwollen rot", "heiß und rot"],
    },
];

/// First-aid guidance read out before a human takes over, one per matched
/// emergency category. Categories without a specific instruction yet fall
/// back to the generic one.
fn safety_instruction_for(category: &str) -> String {
    match category {
        "chest_pain" => "Patient hinsetzen oder mit erhöhtem Oberkörper lagern, beengende Kleidung öffnen.".to_string(),
        "breathing_difficulty" => "Patient aufrecht hinsetzen lassen, für Frischluft sorgen.".to_string(),
        "stroke_symptoms" => "Patient beruhigen, nicht essen oder trinken lassen, Uhrzeit des Symptombeginns notieren.".to_string(),
        "severe_bleeding" => "Direkten Druck auf die Wunde ausüben, Beine hochlagern falls möglich.".to_string(),
        "unconsciousness" => "Atmung prüfen, stabile Seitenlage falls atmend, Herz-Lungen-Wiederbelebung falls nicht.".to_string(),
        "severe_allergic" => "Auf ein verschriebenes Adrenalin-Autoinjektor hinweisen, falls vorhanden.".to_string(),
        _ => "Patient nicht allein lassen, bis Hilfe eintrifft.".to_string(),
    }
}

/// Stateless: one call per utterance. No per-call allocation beyond the
/// result, mirroring the Python module's free functions rather than an
/// instance with mutable fields.
pub struct TriageAssessor;

impl Default for TriageAssessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TriageAssessor {
    pub fn new() -> Self {
        Self
    }

    /// Combines a structured symptom list with free-text emergency/urgent
    /// pattern matching and the patient's risk multiplier, per the base
    /// scoring algorithm: `base = mean(severity) * 10`, plus modifiers for
    /// worsening, fever, pain, and duration, then an urgent-pattern bonus,
    /// then the risk multiplier, clamped to 99 (100 is reserved for
    /// emergencies).
    ///
    /// Edge case: with neither `symptoms` nor `free_text` there is nothing
    /// to triage at all — rejected at the boundary rather than silently
    /// scored as "non-urgent", which would under-react to a caller who,
    /// say, got cut off mid-sentence.
    pub fn assess(
        &self,
        symptoms: &[Symptom],
        patient: &PatientContext,
        free_text: Option<&str>,
    ) -> Result<TriageResult> {
        let free_text = free_text.filter(|t| !t.trim().is_empty());
        if symptoms.is_empty() && free_text.is_none() {
            return Err(PhoneAgentError::InvalidInput(
                "triage requires at least one symptom or non-empty free text".to_string(),
            ));
        }
        let text = free_text.map(|t| t.to_lowercase());
        let mut notes = Vec::new();

        if let Some(text) = &text {
            let emergency_hits = Self::matches(text, EMERGENCY_PATTERNS);
            if !emergency_hits.is_empty() {
                // Fixed at 100, not multiplier-scaled: an emergency pattern
                // match always escalates at maximum severity regardless of
                // the patient's baseline risk profile — the risk multiplier
                // only discriminates within the urgent/standard bands below.
                return Ok(TriageResult {
                    urgency: UrgencyLevel::Emergency,
                    risk_score: 100.0,
                    primary_concern: emergency_hits[0].clone(),
                    max_wait_minutes: UrgencyLevel::Emergency.max_wait_minutes(),
                    requires_callback: true,
                    requires_doctor: true,
                    recommended_action:
                        "Sofort auflegen lassen und den Notruf 112 wählen, falls noch nicht geschehen."
                            .to_string(),
                    safety_instructions: emergency_hits.iter().map(|cat| safety_instruction_for(cat)).collect(),
                    emergency_symptoms: emergency_hits,
                    assessment_notes: vec!["Notfallmuster erkannt – sofortige Eskalation".to_string()],
                });
            }
        }

        // Base severity score from the structured symptom list.
        let mut base_score = 0.0;
        let mut primary_concern = "allgemeines anliegen".to_string();
        if !symptoms.is_empty() {
            let mean_severity: f64 =
                symptoms.iter().map(|s| s.severity as f64).sum::<f64>() / symptoms.len() as f64;
            base_score = mean_severity * 10.0;

            if let Some(most_severe) = symptoms.iter().max_by_key(|s| s.severity) {
                primary_concern = most_severe.name.clone();
            }

            for symptom in symptoms {
                if symptom.is_worsening {
                    base_score += 10.0;
                    notes.push(format!("{} verschlechtert sich", symptom.name));
                }
                if let Some(temp) = symptom.fever_temp.filter(|_| symptom.fever) {
                    if temp >= 39.5 {
                        base_score += 20.0;
                        notes.push(format!("Hohes Fieber: {temp}°C"));
                    } else if temp >= 38.5 {
                        base_score += 10.0;
                    }
                }
                if symptom.pain_level.is_some_and(|p| p >= 8) {
                    base_score += 15.0;
                    notes.push(format!("Starke Schmerzen: {}/10", symptom.pain_level.unwrap()));
                }
                if symptom.duration_hours.is_some_and(|h| h > 72.0) {
                    base_score += 5.0;
                    notes.push("Symptome bestehen seit über 3 Tagen".to_string());
                }
            }
        }

        // Urgent free-text patterns add a flat bonus and force at least
        // URGENT regardless of the accumulated score.
        let mut urgent_found = false;
        if let Some(text) = &text {
            let urgent_hits = Self::matches(text, URGENT_PATTERNS);
            if !urgent_hits.is_empty() {
                urgent_found = true;
                base_score += 15.0;
                notes.push(format!("Dringend: {}", urgent_hits[0]));
            }
        }

        let risk_multiplier = patient.risk_multiplier();
        if risk_multiplier > 1.0 {
            notes.push(format!("Risikopatient (Faktor: {risk_multiplier:.1})"));
        }
        let final_score = (base_score * risk_multiplier).min(99.0);

        let (urgency, action) = if final_score >= 80.0 {
            (UrgencyLevel::VeryUrgent, "Bitte kommen Sie umgehend in die Praxis. Wir informieren den Arzt.")
        } else if final_score >= 60.0 || urgent_found {
            (
                UrgencyLevel::Urgent,
                "Wir geben Ihnen einen dringenden Termin für heute. Bitte kommen Sie so bald wie möglich.",
            )
        } else if final_score >= 40.0 {
            (UrgencyLevel::Standard, "Wir können Ihnen einen Termin für heute oder morgen anbieten.")
        } else {
            (UrgencyLevel::NonUrgent, "Für Ihre Beschwerden können wir einen regulären Termin vereinbaren.")
        };

        Ok(TriageResult {
            urgency,
            risk_score: final_score,
            primary_concern,
            max_wait_minutes: urgency.max_wait_minutes(),
            requires_callback: urgency.requires_callback(),
            requires_doctor: urgency.requires_doctor(),
            recommended_action: action.to_string(),
            safety_instructions: Vec::new(),
            emergency_symptoms: Vec::new(),
            assessment_notes: notes,
        })
    }

    fn matches(text: &str, patterns: &[PatternSet]) -> Vec<String> {
        let mut hits = Vec::new();
        for set in patterns {
            for phrase in set.phrases {
                if text.contains(phrase) {
                    hits.push(set.category.to_string());
                    break;
                }
            }
        }
        hits
    }
}
