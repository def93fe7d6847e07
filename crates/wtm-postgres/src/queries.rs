//! SQL for the scheduled-messages table.
//!
//! Sender filters compare the digits-only projection of `from_chat_id`,
//! matching the normalization applied application-side.

pub const INSERT_MESSAGE: &str = "\
INSERT INTO scheduled_messages (
    id, chat_id, from_chat_id, confirmation_message_id, text, send_at, status,
    locked_at, sent_at, attempt_count, last_error,
    idempotency_key, source, reason,
    created_at, updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)";

pub const GET_BY_ID: &str = "SELECT * FROM scheduled_messages WHERE id = $1";

pub const GET_BY_IDEMPOTENCY_KEY: &str =
    "SELECT * FROM scheduled_messages WHERE idempotency_key = $1";

pub const FIND_BY_ID_PREFIX: &str = "\
SELECT *
FROM scheduled_messages
WHERE REPLACE(id::text, '-', '') LIKE $1 || '%'
ORDER BY created_at DESC
LIMIT $2";

pub const FIND_BY_ID_PREFIX_FOR_SENDER: &str = "\
SELECT *
FROM scheduled_messages
WHERE
    REPLACE(id::text, '-', '') LIKE $1 || '%'
    AND regexp_replace(COALESCE(from_chat_id, ''), '[^0-9]', '', 'g') = $2
ORDER BY created_at DESC
LIMIT $3";

pub const LIST_SCHEDULED_FOR_SENDER: &str = "\
SELECT *
FROM scheduled_messages
WHERE
    status = 'SCHEDULED'
    AND regexp_replace(COALESCE(from_chat_id, ''), '[^0-9]', '', 'g') = $1
ORDER BY send_at
LIMIT $2";

pub const LIST_UPCOMING: &str = "\
SELECT *
FROM scheduled_messages
WHERE (
    status = 'SCHEDULED'
    AND send_at <= $1
) OR (
    status = 'LOCKED'
    AND send_at <= $1
    AND (locked_at IS NULL OR locked_at < $2)
)
ORDER BY send_at
LIMIT $3";

pub const LOCK_FOR_SENDING: &str = "\
UPDATE scheduled_messages
SET
    status = 'LOCKED',
    locked_at = $1,
    updated_at = $1
WHERE
    id = $2
    AND (
        status = 'SCHEDULED'
        OR (
            status = 'LOCKED'
            AND (locked_at IS NULL OR locked_at < $3)
        )
    )";

pub const MARK_SENT: &str = "\
UPDATE scheduled_messages
SET
    status = 'SENT',
    sent_at = $1,
    updated_at = $1
WHERE id = $2";

pub const MARK_FAILED: &str = "\
UPDATE scheduled_messages
SET
    status = 'FAILED',
    last_error = $1,
    attempt_count = attempt_count + 1,
    updated_at = $2
WHERE id = $3";

pub const CANCEL: &str = "\
UPDATE scheduled_messages
SET
    status = 'CANCELLED',
    updated_at = $1
WHERE
    id = $2
    AND status != 'SENT'";

pub const SET_CONFIRMATION_MESSAGE_ID: &str = "\
UPDATE scheduled_messages
SET
    confirmation_message_id = $1,
    updated_at = $2
WHERE id = $3";

pub const FIND_BY_CONFIRMATION_FOR_SENDER: &str = "\
SELECT *
FROM scheduled_messages
WHERE
    confirmation_message_id = $1
    AND status IN ('SCHEDULED', 'LOCKED')
    AND regexp_replace(COALESCE(from_chat_id, ''), '[^0-9]', '', 'g') = $2
ORDER BY created_at DESC
LIMIT 1";
