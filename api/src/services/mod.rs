// Services Module
// Business logic between the handlers and the database

pub mod churn;
