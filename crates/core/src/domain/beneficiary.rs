use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityMeta};
use crate::repository::{non_empty, push_any_of, FieldFilter, FilterValue, SearchCriteria};

/// Registration of a household or individual as a beneficiary of a project.
///
/// The beneficiary itself is referenced either by server id or by client
/// reference id, never both. `tag` carries the voucher / pool-issued
/// beneficiary id when one was handed out in the field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectBeneficiary {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beneficiary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beneficiary_client_reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_registration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl ProjectBeneficiary {
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn beneficiary_id(&self) -> Option<&str> {
        self.beneficiary_id.as_deref()
    }

    pub fn beneficiary_client_reference_id(&self) -> Option<&str> {
        self.beneficiary_client_reference_id.as_deref()
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl Entity for ProjectBeneficiary {
    const ENTITY_TYPE: &'static str = "project-beneficiary";
    const ID_FORMAT: &'static str = "project.beneficiary.id";

    type Criteria = ProjectBeneficiarySearch;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectBeneficiarySearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beneficiary_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beneficiary_client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_registration: Option<i64>,
}

impl SearchCriteria for ProjectBeneficiarySearch {
    fn ids(&self) -> Option<&[String]> {
        non_empty(&self.id)
    }

    fn client_reference_ids(&self) -> Option<&[String]> {
        non_empty(&self.client_reference_id)
    }

    fn field_filters(&self) -> Vec<FieldFilter> {
        let mut filters = Vec::new();
        push_any_of(&mut filters, "projectId", &self.project_id);
        push_any_of(&mut filters, "beneficiaryId", &self.beneficiary_id);
        push_any_of(
            &mut filters,
            "beneficiaryClientReferenceId",
            &self.beneficiary_client_reference_id,
        );
        push_any_of(&mut filters, "tag", &self.tag);
        if let Some(date) = self.date_of_registration {
            filters.push(FieldFilter {
                field: "dateOfRegistration",
                value: FilterValue::Integer(date),
            });
        }
        filters
    }
}
