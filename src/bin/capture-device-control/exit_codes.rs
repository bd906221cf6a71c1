pub const EXIT_OK: i32 = 0;
pub const EXIT_INVALID_REQUEST: i32 = 11;
pub const EXIT_OPERATION_FAILED: i32 = 12;
pub const EXIT_CANCELLED: i32 = 13;
pub const EXIT_BUSY: i32 = 14;
pub const EXIT_UNEXPECTED: i32 = 20;
