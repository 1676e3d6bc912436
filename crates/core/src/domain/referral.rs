use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityMeta};
use crate::repository::{non_empty, push_any_of, FieldFilter, SearchCriteria};

/// A beneficiary referred by a field worker to a facility or another worker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_client_reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reason_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
}

impl Referral {
    pub fn project_beneficiary_id(&self) -> Option<&str> {
        self.project_beneficiary_id.as_deref()
    }

    pub fn project_beneficiary_client_reference_id(&self) -> Option<&str> {
        self.project_beneficiary_client_reference_id.as_deref()
    }

    pub fn referrer_id(&self) -> Option<&str> {
        self.referrer_id.as_deref()
    }

    pub fn recipient_id(&self) -> Option<&str> {
        self.recipient_id.as_deref()
    }
}

impl Entity for Referral {
    const ENTITY_TYPE: &'static str = "referral";
    const ID_FORMAT: &'static str = "referral.id";

    type Criteria = ReferralSearch;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReferralSearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<Vec<String>>,
}

impl SearchCriteria for ReferralSearch {
    fn ids(&self) -> Option<&[String]> {
        non_empty(&self.id)
    }

    fn client_reference_ids(&self) -> Option<&[String]> {
        non_empty(&self.client_reference_id)
    }

    fn field_filters(&self) -> Vec<FieldFilter> {
        let mut filters = Vec::new();
        push_any_of(&mut filters, "projectBeneficiaryId", &self.project_beneficiary_id);
        push_any_of(
            &mut filters,
            "projectBeneficiaryClientReferenceId",
            &self.project_beneficiary_client_reference_id,
        );
        push_any_of(&mut filters, "referrerId", &self.referrer_id);
        push_any_of(&mut filters, "recipientId", &self.recipient_id);
        filters
    }
}
