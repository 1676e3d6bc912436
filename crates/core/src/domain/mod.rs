//! Concrete entity types processed by the pipeline.

pub mod beneficiary;
pub mod facility;
pub mod referral;
pub mod side_effect;
pub mod staff;
pub mod task;

pub use beneficiary::{ProjectBeneficiary, ProjectBeneficiarySearch};
pub use facility::{ProjectFacility, ProjectFacilitySearch};
pub use referral::{Referral, ReferralSearch};
pub use side_effect::{SideEffect, SideEffectSearch};
pub use staff::{ProjectStaff, ProjectStaffSearch};
pub use task::{Address, Task, TaskResource, TaskSearch};
