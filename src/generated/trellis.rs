pub mod ca {
    pub mod v1;
}
pub mod mesh {
    pub mod v1;
}
pub mod telemetry {
    pub mod v1;
}
