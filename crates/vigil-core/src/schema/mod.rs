//! Wire and persistence schemas shared by every subsystem.

pub mod capability;
pub mod finding;
pub mod request;

pub use capability::{
    Capabilities, ExecutionConfig, InputRequirements, OutputFormat, ResourceRequirements,
    ToolCapability, ToolCategory, ToolMetadata,
};
pub use finding::{
    Confidence, Description, Exploitability, Finding, FindingMetadata, Location, Severity,
    SeverityLevel, SourceTool, VerificationStatus, VulnerabilityType,
};
pub use request::{
    ScanContext, ScanLimits, ScanOptions, ScanRequest, ScanTarget, ScanType, TargetKind,
};
