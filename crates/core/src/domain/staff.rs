use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityMeta};
use crate::repository::{non_empty, push_any_of, FieldFilter, SearchCriteria};

/// Assignment of a user to a project for a period.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStaff {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl ProjectStaff {
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }
}

impl Entity for ProjectStaff {
    const ENTITY_TYPE: &'static str = "project-staff";
    const ID_FORMAT: &'static str = "project.staff.id";

    type Criteria = ProjectStaffSearch;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectStaffSearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Vec<String>>,
}

impl SearchCriteria for ProjectStaffSearch {
    fn ids(&self) -> Option<&[String]> {
        non_empty(&self.id)
    }

    fn client_reference_ids(&self) -> Option<&[String]> {
        non_empty(&self.client_reference_id)
    }

    fn field_filters(&self) -> Vec<FieldFilter> {
        let mut filters = Vec::new();
        push_any_of(&mut filters, "projectId", &self.project_id);
        push_any_of(&mut filters, "userId", &self.user_id);
        push_any_of(&mut filters, "channel", &self.channel);
        filters
    }
}
