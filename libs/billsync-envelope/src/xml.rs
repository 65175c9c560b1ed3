//! XML codec for [`MessageEnvelope`].
//!
//! The element layout is a serialization contract with the billing side and
//! is reproduced exactly, not redesigned. Optional fields that are absent
//! are omitted from the document, never written as empty elements, so that
//! UPDATE payloads naturally express "field not changed".
//!
//! Decoding normalizes representational variance in one place: the action is
//! matched case-insensitively and the natural key is validated as non-empty
//! before anything else looks at the message.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::{
    Action, BusinessFields, EnvelopeError, EnvelopeResult, InvoicePayload, MessageEnvelope,
    NaturalKey, Payload, ProductLine, UserPayload,
};

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Encode an envelope to its wire form.
pub fn encode(envelope: &MessageEnvelope) -> EnvelopeResult<String> {
    let body = match &envelope.payload {
        Payload::User(user) => quick_xml::se::to_string(&UserMessageWire::build(envelope, user))?,
        Payload::Invoice(invoice) => {
            quick_xml::se::to_string(&InvoiceMessageWire::build(envelope, invoice))?
        }
    };
    Ok(format!("{XML_DECL}{body}"))
}

/// Decode an envelope from raw bytes as delivered by the broker.
pub fn decode(body: &[u8]) -> EnvelopeResult<MessageEnvelope> {
    let text = std::str::from_utf8(body)?;
    match sniff_root(text)?.as_str() {
        "UserMessage" => quick_xml::de::from_str::<UserMessageWire>(text)?.into_envelope(),
        "InvoiceMessage" => quick_xml::de::from_str::<InvoiceMessageWire>(text)?.into_envelope(),
        other => Err(EnvelopeError::UnknownRoot(other.to_string())),
    }
}

/// Name of the document's root element, which selects the entity kind.
fn sniff_root(text: &str) -> EnvelopeResult<String> {
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                return Ok(String::from_utf8_lossy(start.name().as_ref()).into_owned());
            }
            Event::Eof => return Err(EnvelopeError::UnknownRoot(String::new())),
            // declaration, comments, leading whitespace
            _ => continue,
        }
    }
}

fn parse_occurred_at(value: &str) -> EnvelopeResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| EnvelopeError::BadTimestamp {
            value: value.to_string(),
            source,
        })
}

// Wire structs mirror the document layout one-to-one. Conversions to and
// from the domain types carry all validation, so a successfully decoded
// `MessageEnvelope` is known-good everywhere downstream.

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "UserMessage")]
struct UserMessageWire {
    #[serde(rename = "ActionType")]
    action_type: String,
    #[serde(rename = "UUID", default)]
    uuid: String,
    #[serde(rename = "TimeOfAction")]
    time_of_action: String,
    #[serde(rename = "EncryptedPassword", skip_serializing_if = "Option::is_none")]
    encrypted_password: Option<String>,
    #[serde(rename = "FirstName", skip_serializing_if = "Option::is_none")]
    first_name: Option<String>,
    #[serde(rename = "LastName", skip_serializing_if = "Option::is_none")]
    last_name: Option<String>,
    #[serde(rename = "PhoneNumber", skip_serializing_if = "Option::is_none")]
    phone_number: Option<String>,
    #[serde(rename = "EmailAddress", skip_serializing_if = "Option::is_none")]
    email_address: Option<String>,
    #[serde(rename = "Business", skip_serializing_if = "Option::is_none")]
    business: Option<BusinessWire>,
}

impl UserMessageWire {
    fn build(envelope: &MessageEnvelope, user: &UserPayload) -> Self {
        Self {
            action_type: envelope.action.as_str().to_string(),
            uuid: envelope.natural_key.as_str().to_string(),
            time_of_action: envelope.occurred_at_wire(),
            encrypted_password: user.encrypted_password.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            phone_number: user.phone.clone(),
            email_address: user.email.clone(),
            business: user
                .business
                .as_ref()
                .filter(|b| !b.is_empty())
                .map(BusinessWire::build),
        }
    }

    fn into_envelope(self) -> EnvelopeResult<MessageEnvelope> {
        Ok(MessageEnvelope {
            action: Action::parse_wire(&self.action_type)?,
            natural_key: NaturalKey::new(self.uuid)?,
            occurred_at: parse_occurred_at(&self.time_of_action)?,
            payload: Payload::User(UserPayload {
                encrypted_password: self.encrypted_password,
                first_name: self.first_name,
                last_name: self.last_name,
                phone: self.phone_number,
                email: self.email_address,
                business: self.business.map(BusinessWire::into_fields),
            }),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BusinessWire {
    #[serde(rename = "BusinessName", skip_serializing_if = "Option::is_none")]
    business_name: Option<String>,
    #[serde(rename = "BusinessEmail", skip_serializing_if = "Option::is_none")]
    business_email: Option<String>,
    #[serde(rename = "RealAddress", skip_serializing_if = "Option::is_none")]
    real_address: Option<String>,
    #[serde(rename = "BTWNumber", skip_serializing_if = "Option::is_none")]
    btw_number: Option<String>,
    #[serde(rename = "FacturationAddress", skip_serializing_if = "Option::is_none")]
    facturation_address: Option<String>,
}

impl BusinessWire {
    fn build(fields: &BusinessFields) -> Self {
        Self {
            business_name: fields.name.clone(),
            business_email: fields.email.clone(),
            real_address: fields.real_address.clone(),
            btw_number: fields.btw_number.clone(),
            facturation_address: fields.facturation_address.clone(),
        }
    }

    fn into_fields(self) -> BusinessFields {
        BusinessFields {
            name: self.business_name,
            email: self.business_email,
            real_address: self.real_address,
            btw_number: self.btw_number,
            facturation_address: self.facturation_address,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "InvoiceMessage")]
struct InvoiceMessageWire {
    #[serde(rename = "ActionType")]
    action_type: String,
    #[serde(rename = "UUID", default)]
    uuid: String,
    #[serde(rename = "TimeOfAction")]
    time_of_action: String,
    #[serde(rename = "Products", skip_serializing_if = "Option::is_none")]
    products: Option<ProductsWire>,
}

impl InvoiceMessageWire {
    fn build(envelope: &MessageEnvelope, invoice: &InvoicePayload) -> Self {
        let products = if invoice.products.is_empty() {
            None
        } else {
            Some(ProductsWire {
                product: invoice.products.iter().map(ProductWire::build).collect(),
            })
        };
        Self {
            action_type: envelope.action.as_str().to_string(),
            uuid: envelope.natural_key.as_str().to_string(),
            time_of_action: envelope.occurred_at_wire(),
            products,
        }
    }

    fn into_envelope(self) -> EnvelopeResult<MessageEnvelope> {
        let products = self
            .products
            .map(|p| p.product.into_iter().map(ProductWire::into_line).collect())
            .unwrap_or_default();
        Ok(MessageEnvelope {
            action: Action::parse_wire(&self.action_type)?,
            natural_key: NaturalKey::new(self.uuid)?,
            occurred_at: parse_occurred_at(&self.time_of_action)?,
            payload: Payload::Invoice(InvoicePayload { products }),
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProductsWire {
    #[serde(rename = "Product", default)]
    product: Vec<ProductWire>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProductWire {
    #[serde(rename = "ProductNR")]
    product_nr: String,
    #[serde(rename = "Quantity")]
    quantity: u32,
    #[serde(rename = "UnitPrice")]
    unit_price: String,
}

impl ProductWire {
    fn build(line: &ProductLine) -> Self {
        Self {
            product_nr: line.product_nr.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price.clone(),
        }
    }

    fn into_line(self) -> ProductLine {
        ProductLine {
            product_nr: self.product_nr,
            quantity: self.quantity,
            unit_price: self.unit_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityKind;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 29, 14, 22, 27).unwrap()
            + chrono::Duration::microseconds(816_332)
    }

    fn create_user_envelope() -> MessageEnvelope {
        MessageEnvelope {
            action: Action::Create,
            natural_key: NaturalKey::new("2025-04-29T14:22:27.816332Z").unwrap(),
            occurred_at: sample_time(),
            payload: Payload::User(UserPayload {
                first_name: Some("John".to_string()),
                email: Some("john@example.com".to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn encode_omits_absent_optional_fields() {
        let xml = encode(&create_user_envelope()).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<ActionType>CREATE</ActionType>"));
        assert!(xml.contains("<UUID>2025-04-29T14:22:27.816332Z</UUID>"));
        assert!(xml.contains("<FirstName>John</FirstName>"));
        assert!(xml.contains("<EmailAddress>john@example.com</EmailAddress>"));
        // Absent fields are omitted, never emitted empty.
        assert!(!xml.contains("LastName"));
        assert!(!xml.contains("PhoneNumber"));
        assert!(!xml.contains("Business"));
    }

    #[test]
    fn decode_recovers_encoded_user_envelope() {
        let envelope = create_user_envelope();
        let xml = encode(&envelope).unwrap();
        let decoded = decode(xml.as_bytes()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decode_accepts_lowercase_action() {
        let xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
            <UserMessage>\
            <ActionType>create</ActionType>\
            <UUID>abc-123</UUID>\
            <TimeOfAction>2025-04-29T14:22:27.816332Z</TimeOfAction>\
            </UserMessage>";
        let envelope = decode(xml.as_bytes()).unwrap();
        assert_eq!(envelope.action, Action::Create);
        assert_eq!(envelope.natural_key.as_str(), "abc-123");
    }

    #[test]
    fn decode_rejects_missing_natural_key() {
        let xml = "<UserMessage>\
            <ActionType>UPDATE</ActionType>\
            <TimeOfAction>2025-04-29T14:22:27Z</TimeOfAction>\
            </UserMessage>";
        assert!(matches!(
            decode(xml.as_bytes()),
            Err(EnvelopeError::MissingNaturalKey)
        ));
    }

    #[test]
    fn decode_rejects_unknown_root() {
        let xml = "<OrderMessage><ActionType>CREATE</ActionType></OrderMessage>";
        assert!(matches!(
            decode(xml.as_bytes()),
            Err(EnvelopeError::UnknownRoot(root)) if root == "OrderMessage"
        ));
    }

    #[test]
    fn business_block_round_trips_with_fallback_fields() {
        let envelope = MessageEnvelope {
            action: Action::Create,
            natural_key: NaturalKey::new("8d3b1f9e-5a0c-4e0f-9dd1-2f6a4be9c001").unwrap(),
            occurred_at: sample_time(),
            payload: Payload::User(UserPayload {
                email: Some("owner@bakkerij.be".to_string()),
                business: Some(BusinessFields {
                    name: Some("Bakkerij & Zonen".to_string()),
                    email: Some("owner@bakkerij.be".to_string()),
                    real_address: Some("Stationsstraat 1, Gent, BE".to_string()),
                    btw_number: Some("BE0123456789".to_string()),
                    facturation_address: Some("Stationsstraat 1, Gent, BE".to_string()),
                }),
                ..Default::default()
            }),
        };
        let xml = encode(&envelope).unwrap();
        // Ampersand in the business name must be escaped on the wire.
        assert!(xml.contains("Bakkerij &amp; Zonen"));
        assert_eq!(decode(xml.as_bytes()).unwrap(), envelope);
    }

    #[test]
    fn invoice_envelope_carries_product_lines() {
        let envelope = MessageEnvelope {
            action: Action::Create,
            natural_key: NaturalKey::new("inv-2025-0001").unwrap(),
            occurred_at: sample_time(),
            payload: Payload::Invoice(InvoicePayload {
                products: vec![
                    ProductLine {
                        product_nr: "SKU-17".to_string(),
                        quantity: 2,
                        unit_price: "19.95".to_string(),
                    },
                    ProductLine {
                        product_nr: "SKU-42".to_string(),
                        quantity: 1,
                        unit_price: "250.00".to_string(),
                    },
                ],
            }),
        };
        let xml = encode(&envelope).unwrap();
        assert!(xml.contains("<InvoiceMessage>"));
        assert!(xml.contains("<ProductNR>SKU-17</ProductNR>"));
        let decoded = decode(xml.as_bytes()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn delete_invoice_envelope_omits_products() {
        let envelope = MessageEnvelope {
            action: Action::Delete,
            natural_key: NaturalKey::new("inv-2025-0001").unwrap(),
            occurred_at: sample_time(),
            payload: Payload::empty(EntityKind::Invoice),
        };
        let xml = encode(&envelope).unwrap();
        assert!(!xml.contains("Products"));
        assert_eq!(decode(xml.as_bytes()).unwrap(), envelope);
    }
}
