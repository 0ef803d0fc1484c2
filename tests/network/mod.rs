mod harness;
mod signing;
mod stress_test;
mod three_node;
