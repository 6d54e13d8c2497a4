mod cancellation;
mod runner;
