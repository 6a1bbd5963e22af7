//! Automation and dispatch engine for a WhatsApp CRM: conversational flow
//! execution, paced bulk campaigns and timed pipeline-stage automations.

pub mod campaign;
pub mod config;
pub mod crm;
pub mod error;
pub mod flow;
pub mod llm;
pub mod logger;
pub mod runtime;
pub mod schema;
pub mod template;
