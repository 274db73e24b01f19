//! Wire types and HTTP client for user endpoints.
//!
//! The endpoint protocol is one POST per chunk: the coordinator sends the
//! execution body and the endpoint answers with a tagged union keyed on
//! `status`. Responses are modelled as a closed enum so handling stays
//! exhaustive at compile time.

mod client;
mod requests;
mod responses;

pub use client::{CallOutcome, EndpointCall, EndpointGateway, HttpEndpointGateway, ResponseParts};
pub use requests::{
    AccountInfo, EnvironmentInfo, EventEnvelope, ExecuteRequest, JobIdentity, OrganizationInfo,
    PreprocessRequest, RunIdentity,
};
pub use responses::{
    AutoYieldCheckpoint, CompletedTaskEnvelope, ErrorBody, ExecuteResponse, PreprocessResponse,
    ResumeTaskBody, RunMetadata, TaskRef,
};
