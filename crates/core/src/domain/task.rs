use serde::{Deserialize, Serialize};

use crate::entity::{AuditDetails, ChildContext, Entity, EntityMeta, SubEntityRef};
use crate::repository::{non_empty, push_any_of, FieldFilter, SearchCriteria};

/// A delivery or visit performed for a project beneficiary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(flatten)]
    pub meta: EntityMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_client_reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_start_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_end_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_start_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_end_date: Option<i64>,
    #[serde(default)]
    pub resources: Vec<TaskResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Quantity of one product variant handed over during a task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_variant_id: Option<String>,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub is_delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_comment: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_details: Option<AuditDetails>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pincode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl Task {
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn project_beneficiary_id(&self) -> Option<&str> {
        self.project_beneficiary_id.as_deref()
    }

    pub fn project_beneficiary_client_reference_id(&self) -> Option<&str> {
        self.project_beneficiary_client_reference_id.as_deref()
    }

    pub fn locality_code(&self) -> Option<&str> {
        self.address.as_ref().and_then(|a| a.locality_code.as_deref())
    }

    pub fn pincode(&self) -> Option<&str> {
        self.address.as_ref().and_then(|a| a.pincode.as_deref())
    }
}

// Keeps created* from an earlier stamp and takes lastModified* from the parent.
fn child_audit(existing: Option<&AuditDetails>, parent: &AuditDetails) -> AuditDetails {
    match existing {
        Some(existing) => AuditDetails {
            created_by: existing.created_by.clone(),
            created_time: existing.created_time,
            last_modified_by: parent.last_modified_by.clone(),
            last_modified_time: parent.last_modified_time,
        },
        None => parent.clone(),
    }
}

impl Entity for Task {
    const ENTITY_TYPE: &'static str = "project-task";
    const ID_FORMAT: &'static str = "project.task.id";

    type Criteria = TaskSearch;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn sub_entities(&self) -> Vec<SubEntityRef<'_>> {
        self.resources
            .iter()
            .map(|resource| SubEntityRef {
                kind: "resource",
                key: resource.product_variant_id.as_deref().unwrap_or_default(),
                id: resource.id.as_deref(),
                is_deleted: resource.is_deleted,
            })
            .collect()
    }

    fn enrich_children(&mut self, context: &ChildContext<'_>) {
        let tenant_id = self.meta.tenant_id.clone();
        for resource in &mut self.resources {
            if resource.id.is_none() {
                resource.id = Some((context.new_id)());
            }
            resource.task_id = context.parent_id.map(str::to_string);
            if resource.tenant_id.is_empty() {
                resource.tenant_id = tenant_id.clone();
            }
            resource.audit_details = Some(child_audit(resource.audit_details.as_ref(), context.audit));
        }

        if let Some(address) = self.address.as_mut() {
            if address.id.is_none() {
                address.id = Some((context.new_id)());
            }
            if address.tenant_id.is_empty() {
                address.tenant_id = tenant_id;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_beneficiary_client_reference_id: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality_code: Option<Vec<String>>,
}

impl SearchCriteria for TaskSearch {
    fn ids(&self) -> Option<&[String]> {
        non_empty(&self.id)
    }

    fn client_reference_ids(&self) -> Option<&[String]> {
        non_empty(&self.client_reference_id)
    }

    fn field_filters(&self) -> Vec<FieldFilter> {
        let mut filters = Vec::new();
        push_any_of(&mut filters, "projectId", &self.project_id);
        push_any_of(&mut filters, "projectBeneficiaryId", &self.project_beneficiary_id);
        push_any_of(
            &mut filters,
            "projectBeneficiaryClientReferenceId",
            &self.project_beneficiary_client_reference_id,
        );
        push_any_of(&mut filters, "status", &self.status);
        push_any_of(&mut filters, "address.localityCode", &self.locality_code);
        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrich_children_assigns_ids_and_keeps_created_stamp() {
        let earlier = AuditDetails::for_create("u-0", 10);
        let mut task = Task {
            meta: EntityMeta {
                tenant_id: "t1".into(),
                ..Default::default()
            },
            resources: vec![
                TaskResource {
                    id: Some("r-1".into()),
                    audit_details: Some(earlier.clone()),
                    ..Default::default()
                },
                TaskResource::default(),
            ],
            address: Some(Address::default()),
            ..Default::default()
        };
        let audit = AuditDetails::for_create("u-1", 99);
        let new_id = || "generated".to_string();

        task.enrich_children(&ChildContext {
            parent_id: Some("task-1"),
            audit: &audit,
            new_id: &new_id,
        });

        let first = &task.resources[0];
        assert_eq!(first.id.as_deref(), Some("r-1"));
        let first_audit = first.audit_details.as_ref().unwrap();
        assert_eq!(first_audit.created_by, "u-0");
        assert_eq!(first_audit.last_modified_time, 99);

        let second = &task.resources[1];
        assert_eq!(second.id.as_deref(), Some("generated"));
        assert_eq!(second.task_id.as_deref(), Some("task-1"));
        assert_eq!(second.tenant_id, "t1");
        assert_eq!(task.address.as_ref().unwrap().id.as_deref(), Some("generated"));
    }

    #[test]
    fn flattened_meta_round_trips_through_camel_case_json() {
        let json = serde_json::json!({
            "clientReferenceId": "c-1",
            "tenantId": "t1",
            "projectId": "p-1",
            "rowVersion": 2,
            "resources": [{"productVariantId": "pv-1", "quantity": 3.0}],
            "address": {"pincode": "560001", "localityCode": "L-1"}
        });
        let task: Task = serde_json::from_value(json).expect("decode");
        assert_eq!(task.client_reference_id(), Some("c-1"));
        assert_eq!(task.row_version(), 2);
        assert_eq!(task.locality_code(), Some("L-1"));

        let encoded = serde_json::to_value(&task).expect("encode");
        assert_eq!(encoded["projectId"], "p-1");
        assert_eq!(encoded["isDeleted"], false);
        assert_eq!(encoded["resources"][0]["productVariantId"], "pv-1");
    }
}
