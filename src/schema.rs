//! Database schema description handed to the agents as prompt context.

pub const SCHEMA_DESCRIPTION: &str = r#"TABLE: users
  - user_id (bigint, PK)
  - first_name (text, not null)
  - last_name (text, not null)
  - job_title (text, not null)
  - address (text, not null)
  - description (text)
  - created_at (timestamp without time zone)
  - updated_at (timestamp without time zone)

TABLE: budget
  - budget_id (bigint, PK)
  - user_id (bigint, FK -> users.user_id)
  - budget_name (text, not null)
  - description (text)
  - total_limit (numeric(12,2), default 0, monthly limit)
  - priority_level_int (smallint, 1-10)
  - is_active (boolean, default true)
  - created_at (timestamp without time zone)
  - updated_at (timestamp without time zone)

TABLE: transactions (no updated_at, only created_at)
  - transaction_id (bigint, PK)
  - date (date, not null)
  - amount (numeric(12,2), not null, amount >= 0)
  - time (time without time zone)
  - store_name (text)
  - city (text)
  - neighbourhood (text)
  - type_spending (text)
  - user_id (bigint, FK -> users.user_id)
  - budget_id (bigint, FK -> budget.budget_id)
  - created_at (timestamp without time zone, default now())

TABLE: income
  - income_id (bigint, PK)
  - user_id (bigint, FK -> users.user_id)
  - type_income (text, not null)
  - amount (numeric(12,2), not null)
  - period (text)
  - description (text)
  - created_at (timestamp without time zone)
  - updated_at (timestamp without time zone)

TABLE: goals
  - goal_id (bigint, PK)
  - user_id (bigint, FK -> users.user_id)
  - goal_name (text, not null)
  - description (text)
  - target (numeric(12,2), default 0)
  - start_date (date)
  - due_date (date)
  - status (text, default 'active')
  - plan (text)
  - created_at (timestamp without time zone)
  - updated_at (timestamp without time zone)

TABLE: chat_conversations
  - conversation_id (bigint, PK)
  - user_id (bigint, FK -> users.user_id)
  - title (text)
  - created_at (timestamp with time zone)

TABLE: chat_messages
  - message_id (bigint, PK)
  - conversation_id (bigint, FK -> chat_conversations.conversation_id)
  - sender_type (text: user | assistant | system)
  - source_agent (text)
  - content (text)
  - content_type (text: text | json)
  - created_at (timestamp with time zone)

Notes:
  - All money amounts are in EGP.
  - "budget/category" means transactions.budget_id -> budget.budget_name.
  - Budget limits are per month; compare them against monthly spending only."#;
