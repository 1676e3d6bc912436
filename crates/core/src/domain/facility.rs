use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityMeta};
use crate::repository::{non_empty, push_any_of, FieldFilter, SearchCriteria};

/// Link between a project and a facility serving it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFacility {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility_id: Option<String>,
}

impl ProjectFacility {
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn facility_id(&self) -> Option<&str> {
        self.facility_id.as_deref()
    }
}

impl Entity for ProjectFacility {
    const ENTITY_TYPE: &'static str = "project-facility";
    const ID_FORMAT: &'static str = "project.facility.id";

    type Criteria = ProjectFacilitySearch;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectFacilitySearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facility_id: Option<Vec<String>>,
}

impl SearchCriteria for ProjectFacilitySearch {
    fn ids(&self) -> Option<&[String]> {
        non_empty(&self.id)
    }

    fn client_reference_ids(&self) -> Option<&[String]> {
        non_empty(&self.client_reference_id)
    }

    fn field_filters(&self) -> Vec<FieldFilter> {
        let mut filters = Vec::new();
        push_any_of(&mut filters, "projectId", &self.project_id);
        push_any_of(&mut filters, "facilityId", &self.facility_id);
        filters
    }
}
