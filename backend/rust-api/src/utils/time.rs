use chrono::{DateTime, Utc};
use mongodb::bson::DateTime as BsonDateTime;

pub fn bson_to_chrono(dt: BsonDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_keeps_millisecond_precision() {
        let stored = BsonDateTime::from_millis(1_760_000_000_123);
        assert_eq!(bson_to_chrono(stored).timestamp_millis(), 1_760_000_000_123);
    }
}
