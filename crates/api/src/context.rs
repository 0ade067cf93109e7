use stockledger_core::StaffId;

/// Staff member acting on a request.
///
/// Inserted by the staff middleware; every domain route can rely on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffContext {
    staff_id: StaffId,
}

impl StaffContext {
    pub fn new(staff_id: StaffId) -> Self {
        Self { staff_id }
    }

    pub fn staff_id(&self) -> &StaffId {
        &self.staff_id
    }
}
