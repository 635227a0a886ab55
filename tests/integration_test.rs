mod commons;
mod scenarios;
