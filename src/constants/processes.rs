/// Capacity of the fixed-size process table. Ids are monotonically
/// increasing and never recycled, so this is also a lifetime cap.
pub const MAX_PROCESSES: usize = 10;
