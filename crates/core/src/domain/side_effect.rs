use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityMeta};
use crate::repository::{non_empty, push_any_of, FieldFilter, SearchCriteria};

/// Adverse reaction observed after a delivery task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffect {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_client_reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_client_reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symptoms: Vec<String>,
}

impl SideEffect {
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn task_client_reference_id(&self) -> Option<&str> {
        self.task_client_reference_id.as_deref()
    }

    pub fn project_beneficiary_id(&self) -> Option<&str> {
        self.project_beneficiary_id.as_deref()
    }

    pub fn project_beneficiary_client_reference_id(&self) -> Option<&str> {
        self.project_beneficiary_client_reference_id.as_deref()
    }
}

impl Entity for SideEffect {
    const ENTITY_TYPE: &'static str = "side-effect";
    const ID_FORMAT: &'static str = "side.effect.id";

    type Criteria = SideEffectSearch;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SideEffectSearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symptoms: Option<Vec<String>>,
}

impl SearchCriteria for SideEffectSearch {
    fn ids(&self) -> Option<&[String]> {
        non_empty(&self.id)
    }

    fn client_reference_ids(&self) -> Option<&[String]> {
        non_empty(&self.client_reference_id)
    }

    fn field_filters(&self) -> Vec<FieldFilter> {
        let mut filters = Vec::new();
        push_any_of(&mut filters, "taskId", &self.task_id);
        push_any_of(&mut filters, "taskClientReferenceId", &self.task_client_reference_id);
        push_any_of(&mut filters, "projectBeneficiaryId", &self.project_beneficiary_id);
        push_any_of(
            &mut filters,
            "projectBeneficiaryClientReferenceId",
            &self.project_beneficiary_client_reference_id,
        );
        push_any_of(&mut filters, "symptoms", &self.symptoms);
        filters
    }
}
