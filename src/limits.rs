pub const MAX_BUSINESSES: usize = 100_000;
pub const MAX_APPOINTMENTS_PER_BUSINESS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_LABEL_LEN: usize = 500;
/// One appointment never spans more than a full day.
pub const MAX_APPOINTMENT_MINUTES: i64 = 24 * 60;
pub const MAX_SCHEDULE_JSON_LEN: usize = 4096;
