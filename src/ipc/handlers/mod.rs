pub mod auth;
pub mod backup;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod grades;
pub mod reports;
pub mod settings;
pub mod students;
pub mod timetable;
