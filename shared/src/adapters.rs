use crate::deduplication::{ClaimStatus, DeduplicationStore};
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    operation::put_item::PutItemError,
    types::{AttributeValue, ReturnValuesOnConditionCheckFailure},
    Client,
};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
const STATUS_COMPLETED: &str = "COMPLETED";
const HELD_BY_OWNER: &str = "ProcessingStatus = :in_progress AND ClaimedBy = :owner";

/// Deduplication keys in a DynamoDB table keyed on `MessageKey`.
///
/// `ExpiresAt` holds epoch seconds and doubles as the table's TTL attribute.
/// Expired items are treated as absent even before DynamoDB removes them.
/// `ClaimedBy` records the request id of the invocation holding the claim.
#[derive(Debug)]
pub struct DynamoDbDeduplicationStore {
    table_name: String,
    dynamodb_client: Client,
    lock_timeout: Duration,
    retention: Duration,
}

impl DynamoDbDeduplicationStore {
    pub fn new(
        table_name: String,
        dynamodb_client: Client,
        lock_timeout: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            table_name,
            dynamodb_client,
            lock_timeout,
            retention,
        }
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn number(n: u64) -> AttributeValue {
    AttributeValue::N(n.to_string())
}

fn string(s: &str) -> AttributeValue {
    AttributeValue::S(s.to_string())
}

/// Maps the item that made a claim's condition fail to what the caller sees.
fn claim_status_of_existing(item: Option<&HashMap<String, AttributeValue>>) -> ClaimStatus {
    let completed = item
        .and_then(|item| item.get("ProcessingStatus"))
        .and_then(|v| v.as_s().ok())
        .is_some_and(|status| status == STATUS_COMPLETED);
    if completed {
        ClaimStatus::AlreadyCompleted
    } else {
        ClaimStatus::InProgress
    }
}

#[async_trait]
impl DeduplicationStore for DynamoDbDeduplicationStore {
    async fn begin(&self, key: &str, owner: &str) -> Result<ClaimStatus, String> {
        let now = epoch_seconds();

        let result = self
            .dynamodb_client
            .put_item()
            .table_name(&self.table_name)
            .item("MessageKey", string(key))
            .item("ProcessingStatus", string(STATUS_IN_PROGRESS))
            .item("ClaimedBy", string(owner))
            .item("ExpiresAt", number(now + self.lock_timeout.as_secs()))
            .condition_expression("attribute_not_exists(MessageKey) OR ExpiresAt < :now")
            .expression_attribute_values(":now", number(now))
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;

        match result {
            Ok(_) => Ok(ClaimStatus::Claimed),
            Err(e) => {
                let generic_err_msg = format!("Error claiming message key: {:?}", e);
                match e.into_service_error() {
                    PutItemError::ConditionalCheckFailedException(existing) => {
                        Ok(claim_status_of_existing(existing.item()))
                    }
                    _ => Err(generic_err_msg),
                }
            }
        }
    }

    async fn complete(&self, key: &str, owner: &str) -> Result<(), String> {
        self.dynamodb_client
            .update_item()
            .table_name(&self.table_name)
            .key("MessageKey", string(key))
            .update_expression("SET ProcessingStatus = :status, ExpiresAt = :expires")
            .condition_expression(HELD_BY_OWNER)
            .expression_attribute_values(":status", string(STATUS_COMPLETED))
            .expression_attribute_values(":in_progress", string(STATUS_IN_PROGRESS))
            .expression_attribute_values(":owner", string(owner))
            .expression_attribute_values(
                ":expires",
                number(epoch_seconds() + self.retention.as_secs()),
            )
            .send()
            .await
            .map(|_| ())
            .map_err(|e| format!("Error completing message key: {:?}", e))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), String> {
        // A failed condition means the claim is already gone or belongs to someone else.
        self.dynamodb_client
            .delete_item()
            .table_name(&self.table_name)
            .key("MessageKey", string(key))
            .condition_expression(HELD_BY_OWNER)
            .expression_attribute_values(":in_progress", string(STATUS_IN_PROGRESS))
            .expression_attribute_values(":owner", string(owner))
            .send()
            .await
            .map(|_| ())
            .or_else(|e| {
                let generic_err_msg = format!("Error releasing message key: {:?}", e);
                if e.into_service_error().is_conditional_check_failed_exception() {
                    Ok(())
                } else {
                    Err(generic_err_msg)
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{claim_status_of_existing, string, STATUS_COMPLETED, STATUS_IN_PROGRESS};
    use crate::deduplication::ClaimStatus;
    use aws_sdk_dynamodb::types::AttributeValue;
    use std::collections::HashMap;

    fn existing_item(status: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([
            ("MessageKey".to_string(), string("message#1")),
            ("ProcessingStatus".to_string(), string(status)),
            ("ClaimedBy".to_string(), string("request-1")),
            ("ExpiresAt".to_string(), AttributeValue::N("1700000000".to_string())),
        ])
    }

    #[test]
    fn when_existing_item_completed_should_report_already_completed() {
        let item = existing_item(STATUS_COMPLETED);

        assert_eq!(
            claim_status_of_existing(Some(&item)),
            ClaimStatus::AlreadyCompleted
        );
    }

    #[test]
    fn when_existing_item_in_progress_should_report_in_progress() {
        let item = existing_item(STATUS_IN_PROGRESS);

        assert_eq!(claim_status_of_existing(Some(&item)), ClaimStatus::InProgress);
    }

    #[test]
    fn when_existing_item_missing_or_unreadable_should_report_in_progress() {
        let mut item = existing_item(STATUS_COMPLETED);
        item.insert(
            "ProcessingStatus".to_string(),
            AttributeValue::N("1".to_string()),
        );

        assert_eq!(claim_status_of_existing(None), ClaimStatus::InProgress);
        assert_eq!(claim_status_of_existing(Some(&item)), ClaimStatus::InProgress);
    }
}
