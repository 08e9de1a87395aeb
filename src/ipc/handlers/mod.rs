pub mod attendance;
pub mod core;
pub mod dashboard;
pub mod groups;
pub mod projects;
pub mod reports;
pub mod students;
pub mod subjects;
pub mod users;
