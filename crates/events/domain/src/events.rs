//! Integration Event Model
//!
//! Base shape and identity of every event that crosses a component boundary.
//! Events are plain serde structs carrying a generated UUID and a UTC
//! creation timestamp; the logical event name doubles as the broker routing
//! key and as the lookup key in the subscription registry.

use std::any::Any;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::serialization::{self, JsonOptions};

/// An integration event communicates a fact across service boundaries.
///
/// `NAME` is the logical event type name. By convention it is the short type
/// name of the struct and it must be unique per event type within a process.
pub trait IntegrationEvent: Serialize + Send + Sync + 'static {
    /// Logical event name used as routing key and registry key.
    const NAME: &'static str;

    fn event_id(&self) -> Uuid;

    fn creation_date(&self) -> DateTime<Utc>;
}

/// Object-safe view of an [`IntegrationEvent`].
///
/// The bus and the event log operate on trait objects so that one publish
/// path serves every registered event type. Encoding always goes through the
/// runtime type, so subtype fields are preserved.
pub trait DynIntegrationEvent: Send + Sync + 'static {
    fn id(&self) -> Uuid;

    fn created_at(&self) -> DateTime<Utc>;

    /// Logical event name (routing key).
    fn name(&self) -> &'static str;

    /// Fully qualified type path, recorded in the event log.
    fn type_path(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Serialize the concrete event with the given options.
    fn to_json(&self, options: &JsonOptions) -> Result<Vec<u8>, serde_json::Error>;
}

impl<E> DynIntegrationEvent for E
where
    E: IntegrationEvent,
{
    fn id(&self) -> Uuid {
        self.event_id()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.creation_date()
    }

    fn name(&self) -> &'static str {
        E::NAME
    }

    fn type_path(&self) -> &'static str {
        std::any::type_name::<E>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self, options: &JsonOptions) -> Result<Vec<u8>, serde_json::Error> {
        serialization::serialize(self, options)
    }
}

/// Declare an integration event struct.
///
/// Generates the struct with the base `id` and `creationDate` fields, a
/// `new` constructor that assigns a fresh UUID and the current UTC time, and
/// the [`IntegrationEvent`] implementation with `NAME` set to the short type
/// name. JSON property names are camelCase.
///
/// ```
/// use itintern_events_domain::integration_event;
///
/// integration_event! {
///     pub struct OrderShippedEvent {
///         pub order_id: u64,
///     }
/// }
///
/// let event = OrderShippedEvent::new(42);
/// assert_eq!(event.order_id, 42);
/// ```
#[macro_export]
macro_rules! integration_event {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$field_meta:meta])* $field_vis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        $vis struct $name {
            pub id: ::uuid::Uuid,
            pub creation_date: ::chrono::DateTime<::chrono::Utc>,
            $( $(#[$field_meta])* $field_vis $field : $ty, )*
        }

        impl $name {
            $vis fn new( $( $field : $ty ),* ) -> Self {
                Self {
                    id: ::uuid::Uuid::new_v4(),
                    creation_date: ::chrono::Utc::now(),
                    $( $field, )*
                }
            }
        }

        impl $crate::events::IntegrationEvent for $name {
            const NAME: &'static str = stringify!($name);

            fn event_id(&self) -> ::uuid::Uuid {
                self.id
            }

            fn creation_date(&self) -> ::chrono::DateTime<::chrono::Utc> {
                self.creation_date
            }
        }
    };
}
