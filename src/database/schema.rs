// Table definitions for the engine's backing store.

diesel::table! {
    runs (id) {
        id -> Text,
        org_id -> Text,
        user_id -> Text,
        project_id -> Nullable<Text>,
        session_key -> Text,
        input -> Text,
        status -> Text,
        agent_id -> Text,
        group_id -> Nullable<Text>,
        parent_run_id -> Nullable<Text>,
        delegated_permissions -> Nullable<Text>,
        llm_config -> Nullable<Text>,
        suspend_reason -> Nullable<Text>,
        output -> Nullable<Text>,
        error_code -> Nullable<Text>,
        error_message -> Nullable<Text>,
        created_at -> Text,
        started_at -> Nullable<Text>,
        ended_at -> Nullable<Text>,
        cancelled_at -> Nullable<Text>,
        suspended_at -> Nullable<Text>,
    }
}

diesel::table! {
    run_events (id) {
        id -> BigInt,
        version -> Integer,
        run_id -> Text,
        agent_id -> Text,
        step_id -> Integer,
        span_id -> Text,
        parent_span_id -> Nullable<Text>,
        event_type -> Text,
        payload -> Text,
        contains_secrets -> Integer,
        ts -> Text,
    }
}

diesel::table! {
    checkpoints (run_id, agent_id, step_id) {
        run_id -> Text,
        agent_id -> Text,
        step_id -> Integer,
        snapshot -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    approvals (run_id, tool_call_id) {
        run_id -> Text,
        tool_call_id -> Text,
        tool_name -> Text,
        args -> Text,
        risk_level -> Text,
        reason -> Text,
        status -> Text,
        decision_reason -> Nullable<Text>,
        applied -> Integer,
        created_at -> Text,
        decided_at -> Nullable<Text>,
    }
}

diesel::table! {
    run_dependencies (parent_run_id, child_run_id) {
        parent_run_id -> Text,
        child_run_id -> Text,
        tool_call_id -> Text,
        goal -> Text,
        status -> Text,
        result -> Nullable<Text>,
        error -> Nullable<Text>,
        applied -> Integer,
        created_at -> Text,
        completed_at -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    runs,
    run_events,
    checkpoints,
    approvals,
    run_dependencies,
);
