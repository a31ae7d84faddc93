//! Typed payloads of the entities captured on the device
//!
//! The sync engine treats payloads as opaque JSON. These structs are the
//! write-path view used to build records and the request bodies the remote
//! service expects.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::record::{EntityType, SyncableRecord};
use crate::error::StoreError;

/// A payload that belongs to exactly one entity type
pub trait EntityPayload: Serialize {
    /// Entity type of this payload
    const ENTITY: EntityType;

    /// Wrap the payload in a new pending record
    fn into_record(self) -> Result<SyncableRecord, StoreError>
    where
        Self: Sized,
    {
        let payload =
            serde_json::to_value(&self).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(SyncableRecord::new(Self::ENTITY, payload))
    }
}

/// Patient registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub national_id: Option<String>,
    pub registration_date: NaiveDate,
}

impl EntityPayload for Patient {
    const ENTITY: EntityType = EntityType::Patient;
}

/// Vital signs taken during a visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    /// Local id of the patient record
    pub patient_local_id: String,
    pub visit_date: NaiveDate,
    pub height_cm: f64,
    pub weight_kg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systolic_mmhg: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diastolic_mmhg: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse_bpm: Option<u16>,
}

impl Vitals {
    /// Body mass index derived from height and weight
    pub fn bmi(&self) -> Option<f64> {
        if self.height_cm <= 0.0 {
            return None;
        }
        let meters = self.height_cm / 100.0;
        Some(self.weight_kg / (meters * meters))
    }
}

impl EntityPayload for Vitals {
    const ENTITY: EntityType = EntityType::Vitals;
}

/// General health assessment, taken when BMI is in the normal range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralAssessment {
    pub patient_local_id: String,
    pub visit_date: NaiveDate,
    pub general_health: String,
    pub on_diet: bool,
    pub taking_drugs: bool,
    #[serde(default)]
    pub comments: String,
}

impl EntityPayload for GeneralAssessment {
    const ENTITY: EntityType = EntityType::GeneralAssessment;
}

/// Assessment taken when BMI indicates overweight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverweightAssessment {
    pub patient_local_id: String,
    pub visit_date: NaiveDate,
    pub general_health: String,
    pub ever_on_diet: bool,
    #[serde(default)]
    pub comments: String,
}

impl EntityPayload for OverweightAssessment {
    const ENTITY: EntityType = EntityType::OverweightAssessment;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncState;

    fn visit_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()
    }

    // Test 1: Patient payload becomes a pending patient record
    #[test]
    fn test_patient_into_record() {
        let patient = Patient {
            first_name: "Ama".to_string(),
            last_name: "Mensah".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 2).unwrap(),
            gender: "female".to_string(),
            phone_number: None,
            national_id: Some("GHA-123".to_string()),
            registration_date: visit_date(),
        };

        let record = patient.into_record().unwrap();

        assert_eq!(record.entity_type, EntityType::Patient);
        assert_eq!(record.sync_state, SyncState::Pending);
        assert_eq!(record.payload["first_name"], "Ama");
        assert_eq!(record.payload["date_of_birth"], "1990-01-02");
        assert!(record.payload.get("phone_number").is_none());
    }

    // Test 2: BMI computation
    #[test]
    fn test_vitals_bmi() {
        let vitals = Vitals {
            patient_local_id: "p1".to_string(),
            visit_date: visit_date(),
            height_cm: 180.0,
            weight_kg: 81.0,
            temperature_c: None,
            systolic_mmhg: None,
            diastolic_mmhg: None,
            pulse_bpm: None,
        };
        let bmi = vitals.bmi().unwrap();
        assert!((bmi - 25.0).abs() < 1e-9);

        let invalid = Vitals {
            height_cm: 0.0,
            ..vitals
        };
        assert!(invalid.bmi().is_none());
    }

    // Test 3: Assessments map to their own entity types
    #[test]
    fn test_assessment_entity_types() {
        let general = GeneralAssessment {
            patient_local_id: "p1".to_string(),
            visit_date: visit_date(),
            general_health: "good".to_string(),
            on_diet: false,
            taking_drugs: true,
            comments: String::new(),
        };
        let overweight = OverweightAssessment {
            patient_local_id: "p1".to_string(),
            visit_date: visit_date(),
            general_health: "poor".to_string(),
            ever_on_diet: true,
            comments: "referred".to_string(),
        };

        assert_eq!(
            general.into_record().unwrap().entity_type,
            EntityType::GeneralAssessment
        );
        assert_eq!(
            overweight.into_record().unwrap().entity_type,
            EntityType::OverweightAssessment
        );
    }
}
