//! Adapter for the ACHQ (SpeedChex) gateway.
//!
//! Every request is a form-encoded POST to one endpoint, carrying merchant
//! credentials and a `Command`. Answers come back in the configured
//! [`ResponseFormat`] and are normalized by the matching [`ResponseParser`].

pub mod response;
pub mod transport;

use crate::domain::authorization::{TokenSource, VerificationStatus, ProcessorToken};
use crate::domain::ports::PaymentProcessor;
use crate::domain::processor::{
    PaymentRequest, PaymentSubmission, ProcessorFailure, ProcessorResult, StatusReport,
    TokenizeRequest, VerifiedAccount,
};
use crate::error::Result;
use crate::settings::{Environment, ProcessorSettings, ResponseFormat};
use async_trait::async_trait;
use chrono::NaiveDate;
use response::{
    DelimitedResponseParser, JsonResponseParser, NormalizedResponse, ResponseParser, text_field,
};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};
use transport::{ReqwestTransport, Transport};

pub const CMD_CREATE_TOKEN_JSON: &str = "ECheck.CreateACHQToken";
pub const CMD_CREATE_TOKEN_DELIMITED: &str = "ECheck.CreateToken";
pub const CMD_PROCESS_PAYMENT: &str = "ECheck.ProcessPayment";
pub const CMD_GET_PAYMENT_STATUS: &str = "ECheck.GetPaymentStatus";
pub const CMD_STATUS_TRACKING: &str = "ECheckReports.StatusTrackingQuery";
pub const CMD_CANCEL_PAYMENT: &str = "ECheck.CancelPayment";

/// The gateway rejects longer payment descriptions.
pub const MAX_DESCRIPTION_CHARS: usize = 50;

pub struct AchqClient<T: Transport = ReqwestTransport> {
    settings: ProcessorSettings,
    transport: T,
    parser: Box<dyn ResponseParser>,
}

impl AchqClient<ReqwestTransport> {
    pub fn new(settings: ProcessorSettings) -> Result<Self> {
        let transport = ReqwestTransport::new(Duration::from_secs(settings.timeout_secs))?;
        Ok(Self::with_transport(settings, transport))
    }
}

impl<T: Transport> AchqClient<T> {
    pub fn with_transport(settings: ProcessorSettings, transport: T) -> Self {
        let parser: Box<dyn ResponseParser> = match settings.response_format {
            ResponseFormat::Json => Box::new(JsonResponseParser),
            ResponseFormat::Delimited => Box::new(DelimitedResponseParser),
        };
        Self {
            settings,
            transport,
            parser,
        }
    }

    fn is_json(&self) -> bool {
        self.settings.response_format == ResponseFormat::Json
    }

    /// Field that carries our own transaction id.
    fn reference_field(&self) -> &'static str {
        if self.is_json() {
            "Merchant_ReferenceID"
        } else {
            "Provider_TransactionID"
        }
    }

    fn base_params(&self, command: &str) -> Vec<(String, String)> {
        let settings = &self.settings;
        let mut form = vec![
            ("MerchantID".to_string(), settings.merchant_id.clone()),
            ("Merchant_GateID".to_string(), settings.merchant_gate_id.clone()),
            (
                "Merchant_GateKey".to_string(),
                settings.merchant_gate_key.expose().to_string(),
            ),
        ];
        if let Some(id) = &settings.provider_id {
            form.push(("ProviderID".to_string(), id.clone()));
        }
        if let Some(gate_id) = &settings.provider_gate_id {
            form.push(("Provider_GateID".to_string(), gate_id.clone()));
        }
        if let Some(gate_key) = &settings.provider_gate_key {
            form.push(("Provider_GateKey".to_string(), gate_key.expose().to_string()));
        }
        if settings.environment == Environment::Sandbox {
            form.push(("TestMode".to_string(), "On".to_string()));
        }
        form.push(("Command".to_string(), command.to_string()));
        if self.is_json() {
            form.push(("CommandVersion".to_string(), "2.0".to_string()));
            form.push(("ResponseType".to_string(), "JSON".to_string()));
        }
        form
    }

    async fn call(&self, command: &str, params: Vec<(&str, String)>) -> NormalizedResponse {
        let mut form = self.base_params(command);
        form.extend(params.into_iter().map(|(k, v)| (k.to_string(), v)));

        debug!(command, "Sending processor request");
        match self.transport.post_form(&self.settings.endpoint, &form).await {
            Ok(body) => {
                let response = self.parser.parse(&body);
                if !response.success {
                    warn!(
                        command,
                        code = response.error_code.as_deref().unwrap_or_default(),
                        message = response.error_message.as_deref().unwrap_or_default(),
                        "Processor declined request"
                    );
                }
                response
            }
            Err(e) => {
                warn!(command, error = %e, "Processor request failed");
                NormalizedResponse::failure(None, e.to_string())
            }
        }
    }
}

fn into_failure(response: NormalizedResponse) -> ProcessorFailure {
    ProcessorFailure::new(
        response.error_code,
        response
            .error_message
            .unwrap_or_else(|| "Unknown error".to_string()),
    )
}

fn status_report(fields: &Map<String, Value>) -> StatusReport {
    StatusReport {
        processor_transaction_id: text_field(fields, "TransactionID"),
        reference_id: text_field(fields, "Merchant_ReferenceID")
            .or_else(|| text_field(fields, "Provider_TransactionID")),
        status: text_field(fields, "PaymentStatus"),
        return_code: text_field(fields, "ReturnCode"),
        return_description: text_field(fields, "ReturnDescription"),
        response_code: text_field(fields, "ResponseCode"),
        description: text_field(fields, "Description"),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[async_trait]
impl<T: Transport> PaymentProcessor for AchqClient<T> {
    async fn tokenize_and_verify(
        &self,
        request: &TokenizeRequest,
    ) -> ProcessorResult<VerifiedAccount> {
        let mut params = vec![
            ("RoutingNumber", request.routing_number.expose().to_string()),
            ("AccountNumber", request.account_number.expose().to_string()),
            ("AccountType", request.account_type.as_str().to_string()),
        ];
        let command = if self.is_json() {
            let check_type = request
                .check_type
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| self.settings.default_check_type.clone());
            params.push(("CheckType", check_type));
            CMD_CREATE_TOKEN_JSON
        } else {
            params.push(("Billing_CustomerName", request.customer_name.clone()));
            params.push(("Create_ACHQToken", "Yes".to_string()));
            CMD_CREATE_TOKEN_DELIMITED
        };
        if self.settings.use_express_verify {
            params.push(("Run_ExpressVerify", "Yes".to_string()));
        }

        let response = self.call(command, params).await;
        if !response.success {
            return Err(into_failure(response));
        }

        let token = response
            .text("ACHQToken")
            .ok_or_else(|| ProcessorFailure::message("Processor returned no account token"))?;

        let (verification, code, description) = match response.fields.get("ExpressVerify") {
            Some(Value::Object(verify)) => (
                text_field(verify, "Status"),
                text_field(verify, "Code"),
                text_field(verify, "Description"),
            ),
            _ => (response.text("ExpressVerify_Status"), None, None),
        };

        Ok(VerifiedAccount {
            token: ProcessorToken::new(token),
            bank_name: response.text("BankName"),
            verification: verification
                .as_deref()
                .map(VerificationStatus::from_code)
                .unwrap_or(VerificationStatus::Unknown),
            verification_code: code,
            verification_description: description,
            routing_last4: request.routing_number.last4(),
            account_last4: request.account_number.last4(),
            reference_id: response.text("TransAct_ReferenceID"),
        })
    }

    async fn create_payment(&self, request: &PaymentRequest) -> ProcessorResult<PaymentSubmission> {
        let mut params = vec![
            ("Amount", request.amount.to_wire()),
            ("AccountToken", request.token.expose().to_string()),
            ("PaymentDirection", "FromCustomer".to_string()),
            ("SECCode", request.sec_code.clone()),
            ("Billing_CustomerName", request.customer_name.clone()),
            (
                "Description",
                truncate_chars(&request.description, MAX_DESCRIPTION_CHARS),
            ),
            (self.reference_field(), request.reference_id.to_string()),
        ];
        if request.token_source == TokenSource::Plaid {
            params.push(("TokenSource", "Plaid".to_string()));
        }
        if let Some(ip) = &request.customer_ip {
            params.push(("Customer_IPAddress", ip.clone()));
        }

        let response = self.call(CMD_PROCESS_PAYMENT, params).await;
        if !response.success {
            return Err(into_failure(response));
        }

        let processor_transaction_id = response
            .text("TransactionID")
            .ok_or_else(|| ProcessorFailure::message("Processor returned no transaction id"))?;
        Ok(PaymentSubmission {
            processor_transaction_id,
            status: response
                .text("PaymentStatus")
                .unwrap_or_else(|| "Scheduled".to_string()),
            reference_id: response.text("TransAct_ReferenceID"),
        })
    }

    async fn get_payment_status(
        &self,
        processor_transaction_id: &str,
    ) -> ProcessorResult<StatusReport> {
        let params = vec![("TransactionID", processor_transaction_id.to_string())];
        let response = self.call(CMD_GET_PAYMENT_STATUS, params).await;
        if !response.success {
            return Err(into_failure(response));
        }
        let mut report = status_report(&response.fields);
        report
            .processor_transaction_id
            .get_or_insert_with(|| processor_transaction_id.to_string());
        Ok(report)
    }

    async fn get_status_by_date(&self, date: NaiveDate) -> ProcessorResult<Vec<StatusReport>> {
        let params = vec![("TrackingDate", date.format("%m%d%Y").to_string())];
        let response = self.call(CMD_STATUS_TRACKING, params).await;
        if !response.success {
            return Err(into_failure(response));
        }
        Ok(response.records().iter().map(status_report).collect())
    }

    async fn cancel_payment(&self, processor_transaction_id: &str) -> ProcessorResult<()> {
        let params = vec![("TransactionID", processor_transaction_id.to_string())];
        let response = self.call(CMD_CANCEL_PAYMENT, params).await;
        if response.success {
            Ok(())
        } else {
            Err(into_failure(response))
        }
    }

    fn decode_status_report(&self, raw: &str) -> ProcessorResult<StatusReport> {
        if raw.trim().is_empty() {
            return Err(ProcessorFailure::message("Empty webhook body"));
        }
        let fields = self.parser.fields(raw).map_err(ProcessorFailure::message)?;
        Ok(status_report(&fields))
    }
}
